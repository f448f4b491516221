//! Collaborator seams: command router and payload mapping
//!
//! The core never owns a wire format. Inbound broker messages are opaque
//! byte buffers plus content-type/correlation metadata; an external
//! [`PayloadMapper`] turns them into domain signals and an external
//! [`InboundDispatcher`] (the command/event router) receives the result.
//! [`InboundPipeline`] is the one dispatch path every protocol client feeds,
//! so the consumed/mapped/dropped accounting lives here and nowhere else.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::model::{ConnectionId, Source};
use crate::monitoring::MonitorRegistry;

/// A broker message as received, before mapping.
#[derive(Debug, Clone)]
pub struct RawInbound {
    pub source_address: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
}

/// A mapped domain signal handed to the router.
#[derive(Debug, Clone)]
pub struct ExternalMessage {
    pub connection_id: ConnectionId,
    pub source_address: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    /// Identities the message is attributed to, from the owning source.
    pub authorization_context: Vec<String>,
}

/// An internal signal selected for outbound publication.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    /// Internal signal topic, matched against target topic filters.
    pub topic: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    /// Response signals are accounted per connection, not per target.
    pub is_response: bool,
}

impl OutboundSignal {
    pub fn new<S: Into<String>>(topic: S, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
            content_type: None,
            correlation_id: None,
            is_response: false,
        }
    }

    pub fn response<S: Into<String>>(topic: S, payload: Bytes) -> Self {
        Self {
            is_response: true,
            ..Self::new(topic, payload)
        }
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// The command/event router boundary. Delivery order per connection follows
/// the connection's sequencing point; the router must not block the caller
/// beyond its own internal queueing.
#[async_trait]
pub trait InboundDispatcher: Send + Sync {
    async fn dispatch(&self, message: ExternalMessage) -> ConnectivityResult<()>;
}

/// Payload transformation boundary. The core only moves bytes.
pub trait PayloadMapper: Send + Sync {
    /// Map a raw broker message into the domain payload. Returning an error
    /// counts the message as dropped for its source address.
    fn map_inbound(&self, raw: &RawInbound) -> ConnectivityResult<Bytes>;

    /// Map an outbound domain payload into broker bytes.
    fn map_outbound(&self, signal: &OutboundSignal) -> ConnectivityResult<Bytes>;
}

/// Pass-through mapper; the payload already is the wire format.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMapper;

impl PayloadMapper for IdentityMapper {
    fn map_inbound(&self, raw: &RawInbound) -> ConnectivityResult<Bytes> {
        Ok(raw.payload.clone())
    }

    fn map_outbound(&self, signal: &OutboundSignal) -> ConnectivityResult<Bytes> {
        Ok(signal.payload.clone())
    }
}

/// The single inbound dispatch path of a connection.
///
/// consumed -> mapped (or dropped) -> enforced -> dispatched to the router.
pub struct InboundPipeline {
    connection_id: ConnectionId,
    registry: Arc<MonitorRegistry>,
    mapper: Arc<dyn PayloadMapper>,
    dispatcher: Arc<dyn InboundDispatcher>,
}

impl InboundPipeline {
    pub fn new(
        connection_id: ConnectionId,
        registry: Arc<MonitorRegistry>,
        mapper: Arc<dyn PayloadMapper>,
        dispatcher: Arc<dyn InboundDispatcher>,
    ) -> Self {
        Self {
            connection_id,
            registry,
            mapper,
            dispatcher,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Handle one raw broker message attributed to `source`.
    pub async fn handle(&self, source: &Source, raw: RawInbound) -> ConnectivityResult<()> {
        let address = raw.source_address.clone();
        self.registry
            .for_inbound_consumed(&self.connection_id, &address)
            .record();

        let payload = match self.mapper.map_inbound(&raw) {
            Ok(payload) => payload,
            Err(error) => {
                self.registry
                    .for_inbound_dropped(&self.connection_id, &address)
                    .record();
                warn!(
                    connection = %self.connection_id,
                    address = %address,
                    "Dropping inbound message: {error}"
                );
                return Err(error);
            }
        };
        self.registry
            .for_inbound_mapped(&self.connection_id, &address)
            .record();

        // Attribution to the source's authorization context is the
        // enforcement step; the policy decision itself lives outside.
        if !source.authorization_context.is_empty() {
            self.registry
                .for_inbound_enforced(&self.connection_id, &address)
                .record();
        }

        let message = ExternalMessage {
            connection_id: self.connection_id.clone(),
            source_address: address.clone(),
            payload,
            content_type: raw.content_type,
            correlation_id: raw.correlation_id,
            authorization_context: source.authorization_context.clone(),
        };

        match self.dispatcher.dispatch(message).await {
            Ok(()) => {
                debug!(
                    connection = %self.connection_id,
                    address = %address,
                    "Dispatched inbound message"
                );
                Ok(())
            }
            Err(error) => {
                self.registry
                    .for_inbound_dropped(&self.connection_id, &address)
                    .record();
                Err(error)
            }
        }
    }
}

/// JSON-validating mapper used in tests and simple deployments: the payload
/// must parse as JSON, and passes through unchanged if it does.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMapper;

impl PayloadMapper for JsonMapper {
    fn map_inbound(&self, raw: &RawInbound) -> ConnectivityResult<Bytes> {
        serde_json::from_slice::<serde_json::Value>(&raw.payload)
            .map_err(|e| ConnectivityError::mapping(format!("payload is not valid JSON: {e}")))?;
        Ok(raw.payload.clone())
    }

    fn map_outbound(&self, signal: &OutboundSignal) -> ConnectivityResult<Bytes> {
        Ok(signal.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QualityOfService;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        messages: Mutex<Vec<ExternalMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl InboundDispatcher for Recording {
        async fn dispatch(&self, message: ExternalMessage) -> ConnectivityResult<()> {
            if self.fail {
                return Err(ConnectivityError::transport("router unavailable"));
            }
            self.messages.lock().await.push(message);
            Ok(())
        }
    }

    fn pipeline(
        dispatcher: Arc<Recording>,
        registry: Arc<MonitorRegistry>,
    ) -> InboundPipeline {
        InboundPipeline::new(
            ConnectionId::new("c1"),
            registry,
            Arc::new(JsonMapper),
            dispatcher,
        )
    }

    fn raw(payload: &str) -> RawInbound {
        RawInbound {
            source_address: "data".to_string(),
            payload: Bytes::from(payload.to_string()),
            content_type: Some("application/json".to_string()),
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn valid_message_counts_consumed_and_mapped() {
        let dispatcher = Arc::new(Recording::default());
        let registry = Arc::new(MonitorRegistry::new());
        let pipeline = pipeline(Arc::clone(&dispatcher), Arc::clone(&registry));
        let source = Source::new(["data"], QualityOfService::AtLeastOnce)
            .with_authorization_context(["twin:device-1"]);

        pipeline.handle(&source, raw(r#"{"ok":true}"#)).await.unwrap();

        let id = ConnectionId::new("c1");
        assert_eq!(registry.for_inbound_consumed(&id, "data").get(), 1);
        assert_eq!(registry.for_inbound_mapped(&id, "data").get(), 1);
        assert_eq!(registry.for_inbound_enforced(&id, "data").get(), 1);
        assert_eq!(registry.for_inbound_dropped(&id, "data").get(), 0);

        let messages = dispatcher.messages.lock().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].authorization_context, vec!["twin:device-1"]);
    }

    #[tokio::test]
    async fn unmappable_message_counts_dropped_not_mapped() {
        let dispatcher = Arc::new(Recording::default());
        let registry = Arc::new(MonitorRegistry::new());
        let pipeline = pipeline(Arc::clone(&dispatcher), Arc::clone(&registry));
        let source = Source::new(["data"], QualityOfService::AtLeastOnce);

        let result = pipeline.handle(&source, raw("not json")).await;
        assert!(result.is_err());

        let id = ConnectionId::new("c1");
        assert_eq!(registry.for_inbound_consumed(&id, "data").get(), 1);
        assert_eq!(registry.for_inbound_mapped(&id, "data").get(), 0);
        assert_eq!(registry.for_inbound_dropped(&id, "data").get(), 1);
        assert!(dispatcher.messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn router_failure_counts_dropped_after_mapping() {
        let dispatcher = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let registry = Arc::new(MonitorRegistry::new());
        let pipeline = pipeline(Arc::clone(&dispatcher), Arc::clone(&registry));
        let source = Source::new(["data"], QualityOfService::AtLeastOnce);

        let result = pipeline.handle(&source, raw(r#"{}"#)).await;
        assert!(result.is_err());

        let id = ConnectionId::new("c1");
        assert_eq!(registry.for_inbound_mapped(&id, "data").get(), 1);
        assert_eq!(registry.for_inbound_dropped(&id, "data").get(), 1);
    }
}
