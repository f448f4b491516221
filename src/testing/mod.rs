//! Testing utilities and mock implementations
//!
//! Mock protocol clients and MQTT sessions so the lifecycle, factory and
//! routing layers can be exercised without a broker.

pub mod mocks;

pub use mocks::*;
