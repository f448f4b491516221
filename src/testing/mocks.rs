//! Mock implementations for testing
//!
//! Provides mock ProtocolClient, GenericMqttClient and InboundDispatcher
//! implementations so connection behavior can be tested without brokers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[cfg(feature = "mqtt")]
use crate::client::mqtt::{
    AckHook, GenericMqttClient, GenericMqttConnect, GenericMqttMessage, GenericMqttPublish,
    GenericMqttSubscribe, PendingPublish, SubscriptionOutcome,
};
use crate::client::{ProtocolClient, PublishToken};
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::routing::{ExternalMessage, InboundDispatcher, OutboundSignal};

/// Dispatcher that records every message it receives.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    messages: Mutex<Vec<ExternalMessage>>,
    pub should_fail: bool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<ExternalMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InboundDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: ExternalMessage) -> ConnectivityResult<()> {
        if self.should_fail {
            return Err(ConnectivityError::transport("mock dispatch failure"));
        }
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message);
        }
        Ok(())
    }
}

/// Injects scripted inbound messages into whatever sender the client under
/// test installed on its mock session.
#[cfg(feature = "mqtt")]
#[derive(Clone)]
pub struct InboundInjector {
    slot: Arc<Mutex<Option<mpsc::Sender<GenericMqttMessage>>>>,
}

#[cfg(feature = "mqtt")]
impl InboundInjector {
    pub async fn send(&self, message: GenericMqttMessage) -> ConnectivityResult<()> {
        let sender = self
            .slot
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| ConnectivityError::transport("no inbound sender installed"))?;
        sender
            .send(message)
            .await
            .map_err(|_| ConnectivityError::transport("inbound receiver dropped"))
    }
}

/// Mock MQTT session for testing the version-independent client layer.
#[cfg(feature = "mqtt")]
#[derive(Default)]
pub struct MockMqttSession {
    pub should_fail_connect: bool,
    pub should_fail_publish: bool,
    connects: Arc<Mutex<Vec<GenericMqttConnect>>>,
    disconnects: Arc<Mutex<usize>>,
    publishes: Arc<Mutex<Vec<GenericMqttPublish>>>,
    subscribes: Arc<Mutex<Vec<GenericMqttSubscribe>>>,
    rejected_filters: HashMap<String, String>,
    pending: Arc<Mutex<Vec<PendingPublish>>>,
    inbound: Arc<Mutex<Option<mpsc::Sender<GenericMqttMessage>>>>,
    ack_hook: Arc<Mutex<Option<AckHook>>>,
}

#[cfg(feature = "mqtt")]
impl MockMqttSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_connect() -> Self {
        Self {
            should_fail_connect: true,
            ..Self::default()
        }
    }

    pub fn with_failing_publish() -> Self {
        Self {
            should_fail_publish: true,
            ..Self::default()
        }
    }

    /// Script the broker rejecting one topic filter of a batch subscribe.
    pub fn with_rejected_filter<S: Into<String>, R: Into<String>>(
        mut self,
        filter: S,
        reason: R,
    ) -> Self {
        self.rejected_filters.insert(filter.into(), reason.into());
        self
    }

    /// Script publishes that stay unacknowledged until
    /// [`MockMqttSession::acknowledge`] settles them.
    pub fn with_pending_publishes(self, pending: Vec<PendingPublish>) -> Self {
        if let Ok(mut slot) = self.pending.lock() {
            *slot = pending;
        }
        self
    }

    pub fn recorded_connects(&self) -> Arc<Mutex<Vec<GenericMqttConnect>>> {
        Arc::clone(&self.connects)
    }

    pub fn disconnect_count(&self) -> Arc<Mutex<usize>> {
        Arc::clone(&self.disconnects)
    }

    pub fn recorded_publishes(&self) -> Arc<Mutex<Vec<GenericMqttPublish>>> {
        Arc::clone(&self.publishes)
    }

    pub fn recorded_subscribes(&self) -> Arc<Mutex<Vec<GenericMqttSubscribe>>> {
        Arc::clone(&self.subscribes)
    }

    pub fn injector(&self) -> InboundInjector {
        InboundInjector {
            slot: Arc::clone(&self.inbound),
        }
    }

    /// Simulate the broker acknowledging the oldest pending publish for
    /// `topic`; fires the installed acknowledged hook.
    pub fn acknowledge(&self, topic: &str) {
        let settled = self.pending.lock().ok().and_then(|mut pending| {
            pending
                .iter()
                .position(|p| p.topic == topic)
                .map(|index| pending.remove(index))
        });
        if settled.is_some() {
            if let Ok(slot) = self.ack_hook.lock() {
                if let Some(hook) = slot.as_ref() {
                    hook(topic);
                }
            }
        }
    }
}

#[cfg(feature = "mqtt")]
#[async_trait]
impl GenericMqttClient for MockMqttSession {
    async fn connect(&mut self, connect: GenericMqttConnect) -> ConnectivityResult<()> {
        if self.should_fail_connect {
            return Err(ConnectivityError::transport("mock connect failure"));
        }
        if let Ok(mut connects) = self.connects.lock() {
            connects.push(connect);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> ConnectivityResult<()> {
        if let Ok(mut disconnects) = self.disconnects.lock() {
            *disconnects += 1;
        }
        Ok(())
    }

    async fn publish(&self, publish: GenericMqttPublish) -> ConnectivityResult<()> {
        if self.should_fail_publish {
            return Err(ConnectivityError::transport("mock publish failure"));
        }
        if let Ok(mut publishes) = self.publishes.lock() {
            publishes.push(publish);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subscribe: GenericMqttSubscribe,
    ) -> ConnectivityResult<Vec<SubscriptionOutcome>> {
        let outcomes = subscribe
            .subscriptions
            .iter()
            .map(|subscription| SubscriptionOutcome {
                topic_filter: subscription.topic_filter.clone(),
                granted: match self.rejected_filters.get(&subscription.topic_filter) {
                    Some(reason) => Err(reason.clone()),
                    None => Ok(subscription.qos),
                },
            })
            .collect();
        if let Ok(mut subscribes) = self.subscribes.lock() {
            subscribes.push(subscribe);
        }
        Ok(outcomes)
    }

    fn set_inbound_sender(&mut self, sender: mpsc::Sender<GenericMqttMessage>) {
        if let Ok(mut slot) = self.inbound.lock() {
            *slot = Some(sender);
        }
    }

    fn set_acknowledged_hook(&mut self, hook: AckHook) {
        if let Ok(mut slot) = self.ack_hook.lock() {
            *slot = Some(hook);
        }
    }

    fn unacknowledged_publishes(&self) -> Vec<PendingPublish> {
        self.pending
            .lock()
            .map(|pending| pending.clone())
            .unwrap_or_default()
    }
}

/// Mock protocol client for lifecycle and end-to-end tests.
#[derive(Default)]
pub struct MockProtocolClient {
    pub should_fail_connect: bool,
    connects: Arc<Mutex<usize>>,
    disconnects: Arc<Mutex<usize>>,
    signals: Arc<Mutex<Vec<OutboundSignal>>>,
    leftovers: Arc<Mutex<Vec<PublishToken>>>,
}

impl MockProtocolClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_connect() -> Self {
        Self {
            should_fail_connect: true,
            ..Self::default()
        }
    }

    pub fn with_leftovers(self, leftovers: Vec<PublishToken>) -> Self {
        if let Ok(mut slot) = self.leftovers.lock() {
            *slot = leftovers;
        }
        self
    }

    pub fn connect_count(&self) -> Arc<Mutex<usize>> {
        Arc::clone(&self.connects)
    }

    pub fn disconnect_count(&self) -> Arc<Mutex<usize>> {
        Arc::clone(&self.disconnects)
    }

    pub fn published_signals(&self) -> Arc<Mutex<Vec<OutboundSignal>>> {
        Arc::clone(&self.signals)
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    async fn connect(&mut self) -> ConnectivityResult<()> {
        if let Ok(mut connects) = self.connects.lock() {
            *connects += 1;
        }
        // yield once so watch observers can see the Connecting state before
        // the actor advances to the terminal outcome
        tokio::task::yield_now().await;
        if self.should_fail_connect {
            return Err(ConnectivityError::transport("mock connect failure"));
        }
        Ok(())
    }

    async fn disconnect(&mut self, _drain: Duration) -> ConnectivityResult<()> {
        if let Ok(mut disconnects) = self.disconnects.lock() {
            *disconnects += 1;
        }
        Ok(())
    }

    async fn publish_signal(&self, signal: OutboundSignal) -> ConnectivityResult<()> {
        if let Ok(mut signals) = self.signals.lock() {
            signals.push(signal);
        }
        Ok(())
    }

    fn unacknowledged_publishes(&self) -> Vec<PublishToken> {
        self.leftovers
            .lock()
            .map(|leftovers| leftovers.clone())
            .unwrap_or_default()
    }
}
