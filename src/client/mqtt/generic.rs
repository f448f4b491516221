//! Version-independent MQTT session abstraction
//!
//! The protocol client upstream speaks only in these envelopes; the version
//! specific implementations in [`super::v3`] and [`super::v5`] translate
//! them onto the wire. Which implementation backs a session is decided once
//! at construction, never re-examined afterwards.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ConnectivityResult;
use crate::model::QualityOfService;

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Session parameters for one MQTT connect.
///
/// `session_expiry` and `receive_maximum` only exist on the wire in MQTT 5;
/// the 3.1.1 implementation ignores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMqttConnect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub session_expiry: Option<Duration>,
    pub receive_maximum: Option<u16>,
}

impl GenericMqttConnect {
    pub fn new<S: Into<String>>(client_id: S) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: false,
            keep_alive: DEFAULT_KEEP_ALIVE,
            session_expiry: None,
            receive_maximum: None,
        }
    }

    /// A connect that discards any persisted broker session.
    pub fn clean_session<S: Into<String>>(client_id: S) -> Self {
        Self {
            clean_session: true,
            ..Self::new(client_id)
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_session_expiry(mut self, expiry: Duration) -> Self {
        self.session_expiry = Some(expiry);
        self
    }

    pub fn with_receive_maximum(mut self, maximum: u16) -> Self {
        self.receive_maximum = Some(maximum);
        self
    }
}

/// One outbound MQTT publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMqttPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QualityOfService,
    pub retain: bool,
    /// Carried as correlation data in MQTT 5, dropped in 3.1.1.
    pub correlation_id: Option<String>,
}

impl GenericMqttPublish {
    pub fn new<S: Into<String>>(topic: S, payload: Bytes, qos: QualityOfService) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain: false,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// One requested subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMqttSubscription {
    pub topic_filter: String,
    pub qos: QualityOfService,
}

impl GenericMqttSubscription {
    pub fn new<S: Into<String>>(topic_filter: S, qos: QualityOfService) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
        }
    }
}

/// A batch subscribe across every source address of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMqttSubscribe {
    pub subscriptions: Vec<GenericMqttSubscription>,
}

impl GenericMqttSubscribe {
    pub fn new(subscriptions: Vec<GenericMqttSubscription>) -> Self {
        Self { subscriptions }
    }

    pub fn topic_filters(&self) -> Vec<String> {
        self.subscriptions
            .iter()
            .map(|s| s.topic_filter.clone())
            .collect()
    }
}

/// Broker verdict for a single topic filter out of a batch subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOutcome {
    pub topic_filter: String,
    /// Granted QoS on success, broker reason on rejection.
    pub granted: Result<QualityOfService, String>,
}

impl SubscriptionOutcome {
    pub fn is_granted(&self) -> bool {
        self.granted.is_ok()
    }
}

/// A message the broker delivered for one of our subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMqttMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QualityOfService,
    pub retain: bool,
    pub correlation_id: Option<String>,
}

/// A publish the broker has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    pub pkid: u16,
    pub topic: String,
}

/// The seam between the protocol client and a concrete MQTT version.
///
/// Both implementations keep the same observable behavior: `subscribe`
/// resolves with one outcome per requested filter, inbound messages flow
/// through the sender installed via `set_inbound_sender` (a later call
/// replaces the earlier sender), and `unacknowledged_publishes` lists the
/// publishes still waiting for a broker acknowledgement.
#[async_trait]
pub trait GenericMqttClient: Send + Sync {
    async fn connect(&mut self, connect: GenericMqttConnect) -> ConnectivityResult<()>;

    async fn disconnect(&mut self) -> ConnectivityResult<()>;

    /// Discard any session the broker still holds for `client_id`: a
    /// clean-flag connect immediately followed by a disconnect.
    async fn clean_session(&mut self, client_id: &str) -> ConnectivityResult<()> {
        self.connect(GenericMqttConnect::clean_session(client_id))
            .await?;
        self.disconnect().await
    }

    async fn publish(&self, publish: GenericMqttPublish) -> ConnectivityResult<()>;

    async fn subscribe(
        &self,
        subscribe: GenericMqttSubscribe,
    ) -> ConnectivityResult<Vec<SubscriptionOutcome>>;

    fn set_inbound_sender(&mut self, sender: mpsc::Sender<GenericMqttMessage>);

    /// Install a callback invoked with the topic of every publish the broker
    /// acknowledges. A later call replaces the earlier hook.
    fn set_acknowledged_hook(&mut self, hook: AckHook);

    fn unacknowledged_publishes(&self) -> Vec<PendingPublish>;
}

pub type AckHook = Box<dyn Fn(&str) + Send + Sync>;

/// Subscribe awaiting its SubAck; resolved strictly in request order.
pub(super) struct PendingSubscribe {
    pub filters: Vec<String>,
    pub reply: oneshot::Sender<Vec<SubscriptionOutcome>>,
}

/// State shared between a session handle and its event loop task.
///
/// Packet ids are assigned inside the event loop, so publishes enqueue their
/// topic here first and get paired with a packet id when the outgoing event
/// surfaces; the pairing relies on rumqttc emitting outgoing publish events
/// in enqueue order.
#[derive(Default)]
pub(super) struct SessionShared {
    inbound: Mutex<Option<mpsc::Sender<GenericMqttMessage>>>,
    pending_subscribes: Mutex<VecDeque<PendingSubscribe>>,
    awaiting_pkid: Mutex<VecDeque<String>>,
    pending_publishes: Mutex<BTreeMap<u16, String>>,
    acknowledged_hook: Mutex<Option<AckHook>>,
}

impl SessionShared {
    pub fn set_inbound(&self, sender: mpsc::Sender<GenericMqttMessage>) {
        if let Ok(mut slot) = self.inbound.lock() {
            *slot = Some(sender);
        }
    }

    pub fn set_acknowledged_hook(&self, hook: AckHook) {
        if let Ok(mut slot) = self.acknowledged_hook.lock() {
            *slot = Some(hook);
        }
    }

    pub fn push_pending_subscribe(&self, pending: PendingSubscribe) {
        if let Ok(mut queue) = self.pending_subscribes.lock() {
            queue.push_back(pending);
        }
    }

    /// Resolve the oldest pending subscribe with the per-filter verdicts
    /// from a SubAck.
    pub fn resolve_subscribe(&self, results: Vec<Result<QualityOfService, String>>) {
        let pending = match self.pending_subscribes.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => None,
        };
        let Some(pending) = pending else {
            warn!("broker sent a subscription acknowledgement we did not ask for");
            return;
        };
        let outcomes = pending
            .filters
            .into_iter()
            .zip(results)
            .map(|(topic_filter, granted)| SubscriptionOutcome {
                topic_filter,
                granted,
            })
            .collect();
        let _ = pending.reply.send(outcomes);
    }

    /// Record the topic of a publish about to be handed to the client.
    pub fn enqueue_publish_topic(&self, topic: &str) {
        if let Ok(mut queue) = self.awaiting_pkid.lock() {
            queue.push_back(topic.to_string());
        }
    }

    /// Undo [`SessionShared::enqueue_publish_topic`] after a failed enqueue.
    pub fn abort_last_enqueued(&self) {
        if let Ok(mut queue) = self.awaiting_pkid.lock() {
            queue.pop_back();
        }
    }

    /// Pair the next enqueued topic with the packet id the event loop saw.
    /// Packet id 0 marks a QoS 0 publish which never gets acknowledged.
    pub fn track_publish(&self, pkid: u16) {
        let topic = match self.awaiting_pkid.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => None,
        };
        if pkid == 0 {
            return;
        }
        if let Ok(mut pending) = self.pending_publishes.lock() {
            pending.insert(pkid, topic.unwrap_or_default());
        }
    }

    pub fn settle_publish(&self, pkid: u16) {
        let topic = match self.pending_publishes.lock() {
            Ok(mut pending) => pending.remove(&pkid),
            Err(_) => None,
        };
        if let Some(topic) = topic {
            if let Ok(slot) = self.acknowledged_hook.lock() {
                if let Some(hook) = slot.as_ref() {
                    hook(&topic);
                }
            }
        }
    }

    pub fn unacknowledged(&self) -> Vec<PendingPublish> {
        self.pending_publishes
            .lock()
            .map(|pending| {
                pending
                    .iter()
                    .map(|(pkid, topic)| PendingPublish {
                        pkid: *pkid,
                        topic: topic.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn forward_inbound(&self, message: GenericMqttMessage) {
        let sender = self.inbound.lock().ok().and_then(|slot| slot.clone());
        match sender {
            Some(sender) => {
                if sender.send(message).await.is_err() {
                    warn!("inbound consumer dropped its receiver");
                }
            }
            None => debug!("inbound message arrived before a consumer attached"),
        }
    }
}
