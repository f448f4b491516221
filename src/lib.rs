//! Twinlink - broker connectivity core for a digital-twin platform
//!
//! One lifecycle contract over many broker protocols: connections are
//! immutable descriptors, every protocol (AMQP 0.9.1/1.0, MQTT 3/5, Kafka,
//! HTTP push) is served by a [`client::ProtocolClient`] implementation, and
//! each live connection is driven by exactly one lifecycle actor that owns
//! the client and sequences open/close commands.
//!
//! # Overview
//!
//! - [`model`] - connection descriptors, sources/targets, address aliases
//! - [`client`] - the protocol clients and the factory that picks one
//! - [`lifecycle`] - the per-connection state machine and its actor
//! - [`routing`] - the payload-mapper and command-router seams
//! - [`monitoring`] - per-connection/per-address flow counters
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use twinlink::client::ClientFactory;
//! use twinlink::config::ConnectivityConfig;
//! use twinlink::model::{
//!     Connection, ConnectionId, ConnectionType, ConnectivityStatus, QualityOfService, Source,
//!     Target,
//! };
//! use twinlink::monitoring::MonitorRegistry;
//! use twinlink::routing::IdentityMapper;
//! use twinlink::testing::RecordingDispatcher;
//!
//! # tokio_test::block_on(async {
//! let connection = Connection::builder(
//!     ConnectionId::new("plant-1"),
//!     ConnectionType::Mqtt5,
//!     ConnectivityStatus::Open,
//!     "mqtts://broker.example:8883",
//! )
//! .sources(vec![Source::new(["telemetry/#"], QualityOfService::AtLeastOnce)])
//! .targets(vec![Target::new("twin/out").with_topics(["twin/events"])])
//! .build();
//!
//! let factory = ClientFactory::new(
//!     ConnectivityConfig::default(),
//!     Arc::new(MonitorRegistry::new()),
//!     Arc::new(IdentityMapper),
//!     Arc::new(RecordingDispatcher::new()),
//! );
//! let handle = factory.spawn(connection, HashMap::new()).unwrap();
//! let ack = handle.open().await.unwrap();
//! assert!(ack.is_success());
//! handle.close().await.unwrap();
//! # });
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod monitoring;
pub mod routing;
pub mod testing;

pub use client::{ClientFactory, ProtocolClient, PublishToken};
pub use config::ConnectivityConfig;
pub use error::{ConnectivityError, ConnectivityResult};
pub use lifecycle::{Acknowledgement, ClientState, ConnectionHandle};
pub use model::{Connection, ConnectionId, ConnectionType};
pub use monitoring::MonitorRegistry;
