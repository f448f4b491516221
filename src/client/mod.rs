//! Protocol clients: one implementation per connection type
//!
//! Every client owns the broker-specific session and honors the same
//! contract: `connect` performs the handshake, subscribes all configured
//! sources and arms the targets; `disconnect` drains in-flight publishes
//! under a bounded timeout before tearing the transport down; `publish_signal`
//! fans an internal signal out to every target whose topic filters select it.
//! The lifecycle actor in [`crate::lifecycle`] is the only caller.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConnectivityResult;
use crate::model::{Connection, Target};
use crate::monitoring::MonitorRegistry;
use crate::routing::{InboundDispatcher, InboundPipeline, OutboundSignal, PayloadMapper};

pub mod factory;
#[cfg(feature = "http-push")]
pub mod http_push;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "amqp")]
pub mod amqp091;
#[cfg(feature = "amqp")]
pub mod amqp10;

pub use factory::ClientFactory;

/// A publish the broker has not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishToken {
    pub target_address: String,
    /// Transport-level packet/delivery id where the protocol has one.
    pub packet_id: Option<u64>,
    pub correlation_id: Option<String>,
}

/// The uniform contract every protocol client honors.
///
/// Implementations are thin seams around the underlying broker library and
/// are driven from exactly one task per connection; only `publish_signal`
/// and `unacknowledged_publishes` take `&self`.
#[async_trait]
pub trait ProtocolClient: Send {
    /// Broker handshake, credential exchange, source subscription and target
    /// arming. Returns only once every configured source is subscribed.
    async fn connect(&mut self) -> ConnectivityResult<()>;

    /// Drain in-flight publishes for at most `drain`, then tear down the
    /// transport. Publishes still unacknowledged afterwards stay observable
    /// via [`ProtocolClient::unacknowledged_publishes`].
    async fn disconnect(&mut self, drain: Duration) -> ConnectivityResult<()>;

    /// Publish one internal signal to every target selecting its topic.
    async fn publish_signal(&self, signal: OutboundSignal) -> ConnectivityResult<()>;

    /// Publishes not yet acknowledged by the broker.
    fn unacknowledged_publishes(&self) -> Vec<PublishToken>;
}

/// Everything a protocol client needs beyond the connection descriptor:
/// the router seam, the payload mapper, the monitor registry and the
/// protocol headers the factory received.
pub struct ClientContext {
    pub connection: Connection,
    pub registry: Arc<MonitorRegistry>,
    pub mapper: Arc<dyn PayloadMapper>,
    pub dispatcher: Arc<dyn InboundDispatcher>,
    pub headers: HashMap<String, String>,
}

impl ClientContext {
    /// The one inbound dispatch path for this connection.
    pub fn pipeline(&self) -> InboundPipeline {
        InboundPipeline::new(
            self.connection.id().clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.mapper),
            Arc::clone(&self.dispatcher),
        )
    }
}

/// Split a connection's targets into those selecting `signal_topic` and
/// those filtering it out.
pub fn select_targets<'a>(
    targets: &'a [Target],
    signal_topic: &str,
) -> (Vec<&'a Target>, Vec<&'a Target>) {
    targets.iter().partition(|target| target.selects(signal_topic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Target;

    #[test]
    fn select_targets_partitions_by_filter() {
        let targets = vec![
            Target::new("events").with_topics(["twin/events"]),
            Target::new("firehose"),
            Target::new("alerts").with_topics(["twin/alerts"]),
        ];

        let (selected, filtered) = select_targets(&targets, "twin/events");
        let selected: Vec<_> = selected.iter().map(|t| t.address.as_str()).collect();
        let filtered: Vec<_> = filtered.iter().map(|t| t.address.as_str()).collect();

        assert_eq!(selected, vec!["events", "firehose"]);
        assert_eq!(filtered, vec!["alerts"]);
    }
}
