//! Configuration for the connectivity core
//!
//! Timeouts governing the lifecycle commands plus the tenant-scoping section
//! used to enrich multiplexed connections. Credentials are referenced through
//! environment variable names, never stored in the config file itself.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::Credentials;

/// Top-level connectivity configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConnectivityConfig {
    #[serde(default)]
    pub timeouts: TimeoutSection,
    /// Tenant-multiplexed backend parameters; required only when connections
    /// of the multiplexed type are declared.
    pub tenant: Option<TenantSection>,
}

/// Command deadlines for lifecycle operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    /// Open/close command deadline in seconds (default: 30)
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Generic command acknowledgement deadline in seconds (default: 5)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// How long to wait for expected inbound traffic in seconds (default: 3)
    #[serde(default = "default_inbound_wait_secs")]
    pub inbound_wait_secs: u64,
    /// Drain deadline for in-flight publishes at disconnect in seconds (default: 5)
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_command_timeout_secs() -> u64 {
    5
}

fn default_inbound_wait_secs() -> u64 {
    3
}

fn default_drain_timeout_secs() -> u64 {
    5
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            inbound_wait_secs: default_inbound_wait_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl TimeoutSection {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn inbound_wait(&self) -> Duration {
        Duration::from_secs(self.inbound_wait_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Tenant-scoping parameters for the multiplexed broker backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantSection {
    /// Base URI of the shared backend, overrides the connection's own URI
    pub base_uri: String,
    /// Certificate validation flag applied to enriched connections
    #[serde(default = "default_validate_certificates")]
    pub validate_certificates: bool,
    /// SASL mechanism injected into the specific config of enriched connections
    pub sasl_mechanism: SaslMechanism,
    /// Bootstrap servers injected into the specific config of enriched connections
    pub bootstrap_servers: String,
    /// Environment variable containing the backend username
    pub username_env: Option<String>,
    /// Environment variable containing the backend password
    pub password_env: Option<String>,
}

fn default_validate_certificates() -> bool {
    true
}

/// SASL mechanisms supported by the multiplexed backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SaslMechanism {
    Plain,
    // kebab-case keeps the digits glued to "sha", so spell the names out.
    #[serde(rename = "scram-sha-256")]
    ScramSha256,
    #[serde(rename = "scram-sha-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl TenantSection {
    /// Resolve backend credentials from the configured environment variables.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())?;
        let password = self
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        Some(Credentials::UserPassword { username, password })
    }

    /// Tenant id for an enriched connection; derived from the connection id.
    pub fn tenant_id(&self, connection_id: &crate::model::ConnectionId) -> String {
        connection_id.to_string()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing tenant configuration: {0}")]
    MissingTenantConfig(String),
}

impl ConnectivityConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ConnectivityConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// The tenant section, required for multiplexed connection types.
    pub fn require_tenant(&self) -> Result<&TenantSection, ConfigError> {
        self.tenant.as_ref().ok_or_else(|| {
            ConfigError::MissingTenantConfig(
                "multiplexed connections require a [tenant] section".to_string(),
            )
        })
    }
}
