//! Connection descriptor model
//!
//! Immutable descriptors for connections and their inbound/outbound bindings,
//! plus the address-alias resolver used for tenant-multiplexed deployments.

pub mod aliases;
pub mod connection;

pub use aliases::{resolve_address, resolve_source_aliases, resolve_target_alias, AddressAlias};
pub use connection::{
    Connection, ConnectionBuilder, ConnectionId, ConnectionType, ConnectivityStatus, Credentials,
    QualityOfService, Source, Target,
};
