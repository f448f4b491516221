//! MQTT protocol client
//!
//! The protocol client is generic over [`GenericMqttClient`], so the same
//! source/target plumbing serves MQTT 3.1.1 and MQTT 5. The concrete
//! session is picked once at construction.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ConnectivityError, ConnectivityResult, FilterFailure};
use crate::model::{Connection, QualityOfService};
use crate::monitoring::MonitorRegistry;
use crate::routing::{InboundPipeline, OutboundSignal, PayloadMapper, RawInbound};

use super::{select_targets, ClientContext, ProtocolClient, PublishToken};

pub mod generic;
pub mod v3;
pub mod v5;

pub use generic::{
    AckHook, GenericMqttClient, GenericMqttConnect, GenericMqttMessage, GenericMqttPublish,
    GenericMqttSubscribe, GenericMqttSubscription, PendingPublish, SubscriptionOutcome,
};
pub use v3::Mqtt3Client;
pub use v5::Mqtt5Client;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;
const INBOUND_BUFFER: usize = 256;
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Host/port/TLS triple extracted from a broker URI.
pub(crate) struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

pub(crate) fn broker_endpoint(uri: &str) -> ConnectivityResult<BrokerEndpoint> {
    let url = url::Url::parse(uri)
        .map_err(|_| ConnectivityError::configuration(format!("invalid broker URI: {uri}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| ConnectivityError::configuration(format!("broker URI without host: {uri}")))?
        .to_string();
    let tls = matches!(url.scheme(), "mqtts" | "ssl" | "tls");
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
    Ok(BrokerEndpoint { host, port, tls })
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Protocol client for MQTT connections, generic over the session version.
pub struct MqttProtocolClient<C> {
    session: C,
    connection: Connection,
    registry: Arc<MonitorRegistry>,
    mapper: Arc<dyn PayloadMapper>,
    pipeline: Arc<InboundPipeline>,
    inbound_task: Option<JoinHandle<()>>,
}

impl MqttProtocolClient<Mqtt3Client> {
    pub fn v3(context: ClientContext) -> Self {
        let session = Mqtt3Client::new(
            context.connection.uri(),
            context.connection.credentials().cloned(),
        );
        Self::with_session(session, context)
    }
}

impl MqttProtocolClient<Mqtt5Client> {
    pub fn v5(context: ClientContext) -> Self {
        let session = Mqtt5Client::new(
            context.connection.uri(),
            context.connection.credentials().cloned(),
        );
        Self::with_session(session, context)
    }
}

impl<C: GenericMqttClient> MqttProtocolClient<C> {
    /// Build around an already constructed session; the seam tests use.
    pub fn with_session(session: C, context: ClientContext) -> Self {
        let pipeline = Arc::new(context.pipeline());
        Self {
            session,
            connection: context.connection,
            registry: context.registry,
            mapper: context.mapper,
            pipeline,
            inbound_task: None,
        }
    }

    fn connect_settings(&self) -> GenericMqttConnect {
        let config = self.connection.specific_config();
        let client_id = config
            .get("clientId")
            .cloned()
            .unwrap_or_else(|| format!("{}-{}", self.connection.id(), Uuid::new_v4()));

        let clean_session = config
            .get("cleanSession")
            .map(|v| v == "true")
            .unwrap_or(false);
        let mut settings = if clean_session {
            GenericMqttConnect::clean_session(client_id)
        } else {
            GenericMqttConnect::new(client_id)
        };
        if let Some(keep_alive) = config.get("keepAliveSeconds").and_then(|v| v.parse().ok()) {
            settings = settings.with_keep_alive(Duration::from_secs(keep_alive));
        }
        if let Some(expiry) = config
            .get("sessionExpirySeconds")
            .and_then(|v| v.parse().ok())
        {
            settings = settings.with_session_expiry(Duration::from_secs(expiry));
        }
        if let Some(maximum) = config.get("receiveMaximum").and_then(|v| v.parse().ok()) {
            settings = settings.with_receive_maximum(maximum);
        }
        settings
    }

    fn spawn_inbound_task(&mut self, mut inbound: mpsc::Receiver<GenericMqttMessage>) {
        let pipeline = Arc::clone(&self.pipeline);
        let registry = Arc::clone(&self.registry);
        let connection_id = self.connection.id().clone();
        let sources = self.connection.sources().to_vec();
        let task = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let matched = sources.iter().find(|source| {
                    source
                        .addresses
                        .iter()
                        .any(|address| topic_matches(address, &message.topic))
                });
                let Some(source) = matched else {
                    debug!(topic = %message.topic, "inbound topic matches no configured source");
                    continue;
                };
                let raw = RawInbound {
                    source_address: message.topic.clone(),
                    payload: message.payload.clone(),
                    content_type: None,
                    correlation_id: message.correlation_id.clone(),
                };
                match pipeline.handle(source, raw).await {
                    // the transport ack back to the broker happens implicitly
                    // once the dispatch settled
                    Ok(()) => registry
                        .for_inbound_acknowledged(&connection_id, &message.topic)
                        .record(),
                    Err(error) => {
                        debug!(%error, topic = %message.topic, "inbound message not dispatched");
                    }
                }
            }
        });
        if let Some(previous) = self.inbound_task.replace(task) {
            previous.abort();
        }
    }

    async fn publish_response(&self, signal: OutboundSignal) -> ConnectivityResult<()> {
        let id = self.connection.id();
        self.registry.for_response_dispatched(id).record();
        let payload = match self.mapper.map_outbound(&signal) {
            Ok(payload) => {
                self.registry.for_response_mapped(id).record();
                payload
            }
            Err(error) => {
                self.registry.for_response_dropped(id).record();
                return Err(error);
            }
        };

        let mut publish =
            GenericMqttPublish::new(&signal.topic, payload, QualityOfService::AtLeastOnce);
        if let Some(correlation_id) = &signal.correlation_id {
            publish = publish.with_correlation_id(correlation_id);
        }
        match self.session.publish(publish).await {
            Ok(()) => {
                self.registry.for_response_published(id).record();
                Ok(())
            }
            Err(error) => {
                self.registry.for_response_dropped(id).record();
                Err(error)
            }
        }
    }
}

#[async_trait]
impl<C: GenericMqttClient> ProtocolClient for MqttProtocolClient<C> {
    async fn connect(&mut self) -> ConnectivityResult<()> {
        let registry = Arc::clone(&self.registry);
        let connection_id = self.connection.id().clone();
        self.session.set_acknowledged_hook(Box::new(move |topic| {
            registry
                .for_outbound_acknowledged(&connection_id, topic)
                .record();
        }));

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        self.session.set_inbound_sender(inbound_tx);
        self.spawn_inbound_task(inbound_rx);

        let settings = self.connect_settings();
        self.session.connect(settings).await?;

        let subscriptions: Vec<GenericMqttSubscription> = self
            .connection
            .sources()
            .iter()
            .flat_map(|source| {
                source
                    .addresses
                    .iter()
                    .map(|address| GenericMqttSubscription::new(address.clone(), source.qos))
            })
            .collect();
        if subscriptions.is_empty() {
            return Ok(());
        }

        let outcomes = self
            .session
            .subscribe(GenericMqttSubscribe::new(subscriptions))
            .await?;
        let failures: Vec<FilterFailure> = outcomes
            .iter()
            .filter_map(|outcome| {
                outcome.granted.as_ref().err().map(|reason| FilterFailure {
                    topic_filter: outcome.topic_filter.clone(),
                    reason: reason.clone(),
                })
            })
            .collect();
        if !failures.is_empty() {
            return Err(ConnectivityError::PartialSubscribe {
                total: outcomes.len(),
                failures,
            });
        }
        Ok(())
    }

    async fn disconnect(&mut self, drain: Duration) -> ConnectivityResult<()> {
        let deadline = tokio::time::Instant::now() + drain;
        while !self.session.unacknowledged_publishes().is_empty()
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let leftover = self.session.unacknowledged_publishes();
        if !leftover.is_empty() {
            warn!(
                connection_id = %self.connection.id(),
                count = leftover.len(),
                "drain deadline passed with unacknowledged publishes"
            );
        }
        if let Some(task) = self.inbound_task.take() {
            task.abort();
        }
        self.session.disconnect().await
    }

    async fn publish_signal(&self, signal: OutboundSignal) -> ConnectivityResult<()> {
        if signal.is_response {
            return self.publish_response(signal).await;
        }

        let id = self.connection.id();
        let (selected, filtered) = select_targets(self.connection.targets(), &signal.topic);
        for target in &filtered {
            self.registry
                .for_outbound_filtered(id, &target.address)
                .record();
        }
        if selected.is_empty() {
            return Ok(());
        }

        let payload = self.mapper.map_outbound(&signal)?;
        let mut first_error = None;
        for target in selected {
            self.registry
                .for_outbound_dispatched(id, &target.address)
                .record();
            let mut publish =
                GenericMqttPublish::new(&target.address, payload.clone(), target.qos);
            if let Some(correlation_id) = &signal.correlation_id {
                publish = publish.with_correlation_id(correlation_id);
            }
            match self.session.publish(publish).await {
                Ok(()) => {
                    self.registry
                        .for_outbound_published(id, &target.address)
                        .record();
                }
                Err(error) => {
                    warn!(
                        connection_id = %id,
                        target = %target.address,
                        %error,
                        "publish to target failed"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    fn unacknowledged_publishes(&self) -> Vec<PublishToken> {
        self.session
            .unacknowledged_publishes()
            .into_iter()
            .map(|pending| PublishToken {
                target_address: pending.topic,
                packet_id: Some(u64::from(pending.pkid)),
                correlation_id: None,
            })
            .collect()
    }
}
