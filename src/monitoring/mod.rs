//! Per-connection message accounting
//!
//! Counters keyed by (connection, direction, metric, address), safe for
//! concurrent increment from every publish/consume call site.

pub mod registry;

pub use registry::{
    CounterSnapshot, MetricDirection, MetricType, MonitorCounter, MonitorRegistry,
};
