//! Immutable connection descriptors
//!
//! A `Connection` declares which broker a client talks to, how to
//! authenticate, and the sources/targets it binds. The descriptor is built
//! once and never mutated; tenant enrichment produces a new descriptor
//! through the builder.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of a connection; also the tenant id for multiplexed backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The enumerated broker protocol a connection targets.
///
/// Immutable after creation; the factory dispatches on this exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    // serde's kebab-case does not split before digits, so the digit-bearing
    // variants spell out the wire name matching `as_str`.
    #[serde(rename = "amqp-091")]
    Amqp091,
    #[serde(rename = "amqp-10")]
    Amqp10,
    #[serde(rename = "mqtt-3")]
    Mqtt3,
    #[serde(rename = "mqtt-5")]
    Mqtt5,
    Kafka,
    HttpPush,
    /// Tenant-multiplexed shared backend; enriched and served by the Kafka client.
    Multiplexed,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amqp091 => "amqp-091",
            Self::Amqp10 => "amqp-10",
            Self::Mqtt3 => "mqtt-3",
            Self::Mqtt5 => "mqtt-5",
            Self::Kafka => "kafka",
            Self::HttpPush => "http-push",
            Self::Multiplexed => "multiplexed",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative target state of a connection, not the live client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Open,
    Closed,
}

/// Polymorphic credentials; the resolved protocol client decides which
/// variants it accepts.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Credentials {
    UserPassword { username: String, password: String },
    Token { token: String },
    ClientCert { cert: String, key: String },
}

// Secrets stay out of debug output; errors go through the sanitizer anyway.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserPassword { username, .. } => f
                .debug_struct("UserPassword")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Self::Token { .. } => f.debug_struct("Token").field("token", &"***").finish(),
            Self::ClientCert { cert, .. } => f
                .debug_struct("ClientCert")
                .field("cert", cert)
                .field("key", &"***")
                .finish(),
        }
    }
}

/// Broker-guaranteed delivery strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityOfService {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QualityOfService {
    pub fn code(&self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

/// Inbound binding: broker addresses a connection consumes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Broker addresses/topics; non-empty after alias resolution.
    pub addresses: Vec<String>,
    pub qos: QualityOfService,
    /// Identities a message received here is attributed to.
    #[serde(default)]
    pub authorization_context: Vec<String>,
    /// Where responses to messages from this source are published.
    #[serde(default)]
    pub reply_target: Option<String>,
    /// Parallel consumers bound to this source.
    #[serde(default = "default_consumer_count")]
    pub consumer_count: u32,
}

fn default_consumer_count() -> u32 {
    1
}

impl Source {
    pub fn new<I, S>(addresses: I, qos: QualityOfService) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            qos,
            authorization_context: Vec::new(),
            reply_target: None,
            consumer_count: default_consumer_count(),
        }
    }

    pub fn with_authorization_context<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorization_context = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reply_target<S: Into<String>>(mut self, reply_target: S) -> Self {
        self.reply_target = Some(reply_target.into());
        self
    }
}

/// Outbound binding: a broker address plus the signal filters that select
/// which internal signals get published here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub address: String,
    /// Topic filters; an empty list matches every signal.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_target_qos")]
    pub qos: QualityOfService,
}

fn default_target_qos() -> QualityOfService {
    QualityOfService::AtLeastOnce
}

impl Target {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            topics: Vec::new(),
            qos: default_target_qos(),
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_qos(mut self, qos: QualityOfService) -> Self {
        self.qos = qos;
        self
    }

    /// Whether a signal published under `signal_topic` is selected by this
    /// target. An empty filter list selects everything.
    pub fn selects(&self, signal_topic: &str) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|t| t == signal_topic)
    }
}

/// Immutable connection descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    id: ConnectionId,
    connection_type: ConnectionType,
    status: ConnectivityStatus,
    #[serde(default)]
    credentials: Option<Credentials>,
    uri: String,
    #[serde(default = "default_validate_certificates")]
    validate_certificates: bool,
    #[serde(default)]
    sources: Vec<Source>,
    #[serde(default)]
    targets: Vec<Target>,
    /// Protocol-specific key/value overrides, opaque to the core.
    #[serde(default)]
    specific_config: HashMap<String, String>,
}

fn default_validate_certificates() -> bool {
    true
}

impl Connection {
    pub fn builder(
        id: ConnectionId,
        connection_type: ConnectionType,
        status: ConnectivityStatus,
        uri: impl Into<String>,
    ) -> ConnectionBuilder {
        ConnectionBuilder {
            connection: Connection {
                id,
                connection_type,
                status,
                credentials: None,
                uri: uri.into(),
                validate_certificates: default_validate_certificates(),
                sources: Vec::new(),
                targets: Vec::new(),
                specific_config: HashMap::new(),
            },
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn validate_certificates(&self) -> bool {
        self.validate_certificates
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn specific_config(&self) -> &HashMap<String, String> {
        &self.specific_config
    }

    /// Rebuild this descriptor with the same id/type/status as a starting
    /// point for enrichment.
    pub fn rebuild(&self) -> ConnectionBuilder {
        ConnectionBuilder {
            connection: self.clone(),
        }
    }
}

/// Builder for connection descriptors; the only way to construct one.
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    connection: Connection,
}

impl ConnectionBuilder {
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.connection.uri = uri.into();
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.connection.credentials = Some(credentials);
        self
    }

    pub fn validate_certificates(mut self, validate: bool) -> Self {
        self.connection.validate_certificates = validate;
        self
    }

    pub fn sources(mut self, sources: Vec<Source>) -> Self {
        self.connection.sources = sources;
        self
    }

    pub fn targets(mut self, targets: Vec<Target>) -> Self {
        self.connection.targets = targets;
        self
    }

    pub fn specific_config_entry(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.connection
            .specific_config
            .insert(key.into(), value.into());
        self
    }

    pub fn specific_config(mut self, config: HashMap<String, String>) -> Self {
        self.connection.specific_config = config;
        self
    }

    pub fn build(self) -> Connection {
        self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> Connection {
        Connection::builder(
            ConnectionId::new("conn-1"),
            ConnectionType::Mqtt5,
            ConnectivityStatus::Closed,
            "tcp://localhost:1883",
        )
        .sources(vec![Source::new(["data"], QualityOfService::ExactlyOnce)])
        .targets(vec![Target::new("events").with_topics(["twin/events"])])
        .build()
    }

    #[test]
    fn builder_produces_immutable_descriptor() {
        let connection = test_connection();
        assert_eq!(connection.id().as_str(), "conn-1");
        assert_eq!(connection.connection_type(), ConnectionType::Mqtt5);
        assert_eq!(connection.sources().len(), 1);
        assert_eq!(connection.targets().len(), 1);
        assert!(connection.validate_certificates());
    }

    #[test]
    fn rebuild_preserves_identity_and_allows_overrides() {
        let original = test_connection();
        let enriched = original
            .rebuild()
            .uri("ssl://shared-backend:9094")
            .validate_certificates(false)
            .specific_config_entry("saslMechanism", "PLAIN")
            .build();

        assert_eq!(enriched.id(), original.id());
        assert_eq!(enriched.connection_type(), original.connection_type());
        assert_eq!(enriched.uri(), "ssl://shared-backend:9094");
        assert!(!enriched.validate_certificates());
        assert_eq!(
            enriched.specific_config().get("saslMechanism"),
            Some(&"PLAIN".to_string())
        );
        // the source/target bindings survive the rebuild
        assert_eq!(enriched.sources(), original.sources());
    }

    #[test]
    fn target_selection_by_topic_filter() {
        let target = Target::new("events").with_topics(["twin/events", "twin/alerts"]);
        assert!(target.selects("twin/events"));
        assert!(!target.selects("twin/commands"));

        let catch_all = Target::new("firehose");
        assert!(catch_all.selects("anything"));
    }

    #[test]
    fn qos_codes_round_trip() {
        for qos in [
            QualityOfService::AtMostOnce,
            QualityOfService::AtLeastOnce,
            QualityOfService::ExactlyOnce,
        ] {
            assert_eq!(QualityOfService::from_code(qos.code()), Some(qos));
        }
        assert_eq!(QualityOfService::from_code(3), None);
    }

    #[test]
    fn connection_type_serde_uses_kebab_case() {
        for kind in [
            ConnectionType::Amqp091,
            ConnectionType::Amqp10,
            ConnectionType::Mqtt3,
            ConnectionType::Mqtt5,
            ConnectionType::Kafka,
            ConnectionType::HttpPush,
            ConnectionType::Multiplexed,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let parsed: ConnectionType = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let credentials = Credentials::UserPassword {
            username: "twin".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{credentials:?}");
        assert!(debug.contains("twin"));
        assert!(!debug.contains("hunter2"));
    }
}
