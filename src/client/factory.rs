//! Client factory: connection type to protocol client, resolved exactly once
//!
//! The factory is a plain value; callers construct one wherever they need it
//! and every `build` call is independent. Dispatch is a closed match over
//! [`ConnectionType`], so adding a connection type is a compile error until
//! every arm is handled. Multiplexed connections are enriched with the tenant
//! backend parameters first and then served by the Kafka client.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::ConnectivityConfig;
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::lifecycle::{ConnectionActor, ConnectionHandle};
use crate::model::{
    resolve_source_aliases, resolve_target_alias, Connection, ConnectionType,
};
use crate::monitoring::MonitorRegistry;
use crate::routing::{InboundDispatcher, PayloadMapper};

#[cfg(feature = "amqp")]
use super::amqp091::Amqp091Client;
#[cfg(feature = "amqp")]
use super::amqp10::Amqp10Client;
#[cfg(feature = "http-push")]
use super::http_push::HttpPushClient;
#[cfg(feature = "kafka")]
use super::kafka::KafkaClient;
#[cfg(feature = "mqtt")]
use super::mqtt::MqttProtocolClient;
use super::{ClientContext, ProtocolClient};

/// Builds protocol clients for connection descriptors.
pub struct ClientFactory {
    config: ConnectivityConfig,
    registry: Arc<MonitorRegistry>,
    mapper: Arc<dyn PayloadMapper>,
    dispatcher: Arc<dyn InboundDispatcher>,
}

impl ClientFactory {
    pub fn new(
        config: ConnectivityConfig,
        registry: Arc<MonitorRegistry>,
        mapper: Arc<dyn PayloadMapper>,
        dispatcher: Arc<dyn InboundDispatcher>,
    ) -> Self {
        Self {
            config,
            registry,
            mapper,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &Arc<MonitorRegistry> {
        &self.registry
    }

    /// Build the protocol client for `connection`. Multiplexed connections
    /// are enriched first; unsupported types in this build fail fast with a
    /// configuration error.
    pub fn build(
        &self,
        connection: Connection,
        headers: HashMap<String, String>,
    ) -> ConnectivityResult<Box<dyn ProtocolClient>> {
        let connection = match connection.connection_type() {
            ConnectionType::Multiplexed => self.enrich_multiplexed(connection)?,
            _ => connection,
        };
        self.registry.init_for_connection(&connection);
        info!(
            connection_id = %connection.id(),
            connection_type = %connection.connection_type(),
            "building protocol client"
        );

        let kind = connection.connection_type();
        let context = ClientContext {
            connection,
            registry: Arc::clone(&self.registry),
            mapper: Arc::clone(&self.mapper),
            dispatcher: Arc::clone(&self.dispatcher),
            headers,
        };

        match kind {
            ConnectionType::Mqtt3 => {
                #[cfg(feature = "mqtt")]
                {
                    Ok(Box::new(MqttProtocolClient::v3(context)))
                }
                #[cfg(not(feature = "mqtt"))]
                {
                    Err(unsupported(kind, context))
                }
            }
            ConnectionType::Mqtt5 => {
                #[cfg(feature = "mqtt")]
                {
                    Ok(Box::new(MqttProtocolClient::v5(context)))
                }
                #[cfg(not(feature = "mqtt"))]
                {
                    Err(unsupported(kind, context))
                }
            }
            ConnectionType::HttpPush => {
                #[cfg(feature = "http-push")]
                {
                    Ok(Box::new(HttpPushClient::new(context)))
                }
                #[cfg(not(feature = "http-push"))]
                {
                    Err(unsupported(kind, context))
                }
            }
            ConnectionType::Kafka | ConnectionType::Multiplexed => {
                #[cfg(feature = "kafka")]
                {
                    Ok(Box::new(KafkaClient::new(context)))
                }
                #[cfg(not(feature = "kafka"))]
                {
                    Err(unsupported(kind, context))
                }
            }
            ConnectionType::Amqp091 => {
                #[cfg(feature = "amqp")]
                {
                    Ok(Box::new(Amqp091Client::new(context)))
                }
                #[cfg(not(feature = "amqp"))]
                {
                    Err(unsupported(kind, context))
                }
            }
            ConnectionType::Amqp10 => {
                #[cfg(feature = "amqp")]
                {
                    Ok(Box::new(Amqp10Client::new(context)))
                }
                #[cfg(not(feature = "amqp"))]
                {
                    Err(unsupported(kind, context))
                }
            }
        }
    }

    /// Build the client and hand it to a spawned lifecycle actor.
    pub fn spawn(
        &self,
        connection: Connection,
        headers: HashMap<String, String>,
    ) -> ConnectivityResult<ConnectionHandle> {
        let connection_id = connection.id().clone();
        let client = self.build(connection, headers)?;
        Ok(ConnectionActor::spawn(
            connection_id,
            client,
            self.config.timeouts.clone(),
        ))
    }

    /// Rewrite a multiplexed connection onto the shared tenant backend:
    /// backend URI and credentials, SASL parameters in the specific config,
    /// and every source/target address resolved into the tenant's space.
    fn enrich_multiplexed(&self, connection: Connection) -> ConnectivityResult<Connection> {
        let tenant = self
            .config
            .require_tenant()
            .map_err(|e| ConnectivityError::configuration(e.to_string()))?;
        let tenant_id = tenant.tenant_id(connection.id());

        let sources = connection
            .sources()
            .iter()
            .map(|source| resolve_source_aliases(source, &tenant_id))
            .collect();
        let targets = connection
            .targets()
            .iter()
            .map(|target| resolve_target_alias(target, &tenant_id))
            .collect();

        let mut builder = connection
            .rebuild()
            .uri(tenant.base_uri.clone())
            .validate_certificates(tenant.validate_certificates)
            .sources(sources)
            .targets(targets)
            .specific_config_entry("saslMechanism", tenant.sasl_mechanism.as_str())
            .specific_config_entry("bootstrapServers", tenant.bootstrap_servers.clone());
        if let Some(credentials) = tenant.credentials() {
            builder = builder.credentials(credentials);
        }
        Ok(builder.build())
    }
}

#[cfg(any(
    not(feature = "mqtt"),
    not(feature = "http-push"),
    not(feature = "kafka"),
    not(feature = "amqp")
))]
fn unsupported(kind: ConnectionType, context: ClientContext) -> ConnectivityError {
    drop(context);
    ConnectivityError::configuration(format!(
        "connection type {kind} is not enabled in this build"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SaslMechanism, TenantSection};
    use crate::model::{
        ConnectionId, ConnectivityStatus, QualityOfService, Source, Target,
    };
    use crate::routing::IdentityMapper;
    use crate::testing::RecordingDispatcher;

    fn factory(config: ConnectivityConfig) -> ClientFactory {
        ClientFactory::new(
            config,
            Arc::new(MonitorRegistry::new()),
            Arc::new(IdentityMapper),
            Arc::new(RecordingDispatcher::new()),
        )
    }

    fn connection(kind: ConnectionType, uri: &str) -> Connection {
        Connection::builder(
            ConnectionId::new("factory-test"),
            kind,
            ConnectivityStatus::Open,
            uri,
        )
        .sources(vec![Source::new(["telemetry"], QualityOfService::AtLeastOnce)
            .with_reply_target("command_response")])
        .targets(vec![Target::new("command").with_topics(["twin/commands"])])
        .build()
    }

    #[cfg(feature = "mqtt")]
    #[test]
    fn builds_both_mqtt_versions() {
        let factory = factory(ConnectivityConfig::default());
        for kind in [ConnectionType::Mqtt3, ConnectionType::Mqtt5] {
            let result = factory.build(connection(kind, "mqtt://broker:1883"), HashMap::new());
            assert!(result.is_ok(), "no client for {kind}");
        }
    }

    #[cfg(feature = "http-push")]
    #[test]
    fn builds_http_push_client() {
        let factory = factory(ConnectivityConfig::default());
        let connection = Connection::builder(
            ConnectionId::new("sink"),
            ConnectionType::HttpPush,
            ConnectivityStatus::Open,
            "https://sink.example/api",
        )
        .targets(vec![Target::new("POST:/telemetry")])
        .build();
        assert!(factory.build(connection, HashMap::new()).is_ok());
    }

    #[test]
    fn multiplexed_without_tenant_section_is_a_configuration_error() {
        let factory = factory(ConnectivityConfig::default());
        let result = factory.build(
            connection(ConnectionType::Multiplexed, "ssl://ignored:9094"),
            HashMap::new(),
        );
        match result {
            Err(ConnectivityError::Configuration { message }) => {
                assert!(message.contains("tenant"), "unexpected message: {message}");
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn multiplexed_enrichment_scopes_addresses_to_the_tenant() {
        let config = ConnectivityConfig {
            tenant: Some(TenantSection {
                base_uri: "ssl://shared-backend:9094".to_string(),
                validate_certificates: false,
                sasl_mechanism: SaslMechanism::ScramSha512,
                bootstrap_servers: "kafka-1:9094,kafka-2:9094".to_string(),
                username_env: None,
                password_env: None,
            }),
            ..Default::default()
        };
        let factory = factory(config);

        let enriched = factory
            .enrich_multiplexed(connection(ConnectionType::Multiplexed, "tcp://declared:1"))
            .unwrap();

        assert_eq!(enriched.uri(), "ssl://shared-backend:9094");
        assert!(!enriched.validate_certificates());
        assert_eq!(
            enriched.sources()[0].addresses,
            vec!["telemetry/factory-test"]
        );
        assert_eq!(
            enriched.sources()[0].reply_target.as_deref(),
            Some("command_response/factory-test")
        );
        assert_eq!(enriched.targets()[0].address, "command/factory-test");
        // declared topic filters are not addresses; they stay as-is
        assert_eq!(enriched.targets()[0].topics, vec!["twin/commands"]);
        assert_eq!(
            enriched.specific_config().get("saslMechanism"),
            Some(&"SCRAM-SHA-512".to_string())
        );
        assert_eq!(
            enriched.specific_config().get("bootstrapServers"),
            Some(&"kafka-1:9094,kafka-2:9094".to_string())
        );
    }
}
