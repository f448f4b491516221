//! Monitor registry: counters by direction, metric and address
//!
//! Counters are handed out as `Arc` handles, so increments are plain atomic
//! adds and never touch the registry lock. The lock is held only for
//! lookup, init and reset; telemetry reads go through the same handles and
//! never block writers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::{Connection, ConnectionId};

/// Direction a counted message travelled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricDirection {
    Inbound,
    Outbound,
    Response,
}

/// What happened to the counted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Consumed,
    Mapped,
    Enforced,
    Dropped,
    Filtered,
    Published,
    Acknowledged,
    Dispatched,
}

/// One monotonic counter plus the instant it last moved.
#[derive(Debug, Default)]
pub struct MonitorCounter {
    count: AtomicU64,
    last_activity: AtomicU64,
}

impl MonitorCounter {
    fn new() -> Self {
        Self::default()
    }

    /// Record one message. Safe under concurrent callers; no updates are lost.
    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.last_activity
            .store(epoch_seconds(), Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Seconds since the epoch of the last `record`, or `None` if untouched.
    pub fn last_activity(&self) -> Option<u64> {
        match self.last_activity.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    direction: MetricDirection,
    metric: MetricType,
    /// Target address for outbound, source address for inbound, `None` for
    /// response metrics (responses are not bound to a specific target).
    address: Option<String>,
}

/// Exported view of a single counter, for telemetry.
#[derive(Debug, Clone)]
pub struct CounterSnapshot {
    pub direction: MetricDirection,
    pub metric: MetricType,
    pub address: Option<String>,
    pub count: u64,
    pub last_activity: Option<u64>,
}

/// Registry of message counters for every live connection.
#[derive(Debug, Default)]
pub struct MonitorRegistry {
    connections: RwLock<HashMap<ConnectionId, HashMap<CounterKey, Arc<MonitorCounter>>>>,
}

const OUTBOUND_METRICS: [MetricType; 4] = [
    MetricType::Dispatched,
    MetricType::Filtered,
    MetricType::Published,
    MetricType::Acknowledged,
];

const INBOUND_METRICS: [MetricType; 5] = [
    MetricType::Consumed,
    MetricType::Acknowledged,
    MetricType::Mapped,
    MetricType::Enforced,
    MetricType::Dropped,
];

const RESPONSE_METRICS: [MetricType; 4] = [
    MetricType::Dispatched,
    MetricType::Dropped,
    MetricType::Mapped,
    MetricType::Published,
];

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zeroed counter set for every (direction, metric, address)
    /// combination implied by the connection's sources and targets.
    pub fn init_for_connection(&self, connection: &Connection) {
        let mut counters = HashMap::new();

        for source in connection.sources() {
            for address in &source.addresses {
                for metric in INBOUND_METRICS {
                    counters.insert(
                        CounterKey {
                            direction: MetricDirection::Inbound,
                            metric,
                            address: Some(address.clone()),
                        },
                        Arc::new(MonitorCounter::new()),
                    );
                }
            }
        }
        for target in connection.targets() {
            for metric in OUTBOUND_METRICS {
                counters.insert(
                    CounterKey {
                        direction: MetricDirection::Outbound,
                        metric,
                        address: Some(target.address.clone()),
                    },
                    Arc::new(MonitorCounter::new()),
                );
            }
        }
        for metric in RESPONSE_METRICS {
            counters.insert(
                CounterKey {
                    direction: MetricDirection::Response,
                    metric,
                    address: None,
                },
                Arc::new(MonitorCounter::new()),
            );
        }

        if let Ok(mut connections) = self.connections.write() {
            connections.insert(connection.id().clone(), counters);
        }
    }

    /// Discard every counter owned by the connection. Counters of other
    /// connections are untouched.
    pub fn reset_for_connection(&self, connection_id: &ConnectionId) {
        if let Ok(mut connections) = self.connections.write() {
            connections.remove(connection_id);
        }
    }

    /// Export all counters of one connection.
    pub fn snapshot(&self, connection_id: &ConnectionId) -> Vec<CounterSnapshot> {
        let Ok(connections) = self.connections.read() else {
            return Vec::new();
        };
        connections
            .get(connection_id)
            .map(|counters| {
                counters
                    .iter()
                    .map(|(key, counter)| CounterSnapshot {
                        direction: key.direction,
                        metric: key.metric,
                        address: key.address.clone(),
                        count: counter.get(),
                        last_activity: counter.last_activity(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn counter(
        &self,
        connection_id: &ConnectionId,
        direction: MetricDirection,
        metric: MetricType,
        address: Option<&str>,
    ) -> Arc<MonitorCounter> {
        let key = CounterKey {
            direction,
            metric,
            address: address.map(str::to_string),
        };

        if let Ok(connections) = self.connections.read() {
            if let Some(counter) = connections
                .get(connection_id)
                .and_then(|counters| counters.get(&key))
            {
                return Arc::clone(counter);
            }
        }

        // Created on first use for addresses that were not declared up front.
        // A poisoned registry hands out a detached counter; monitoring
        // degrades but the message path keeps moving.
        match self.connections.write() {
            Ok(mut connections) => {
                let counters = connections.entry(connection_id.clone()).or_default();
                Arc::clone(
                    counters
                        .entry(key)
                        .or_insert_with(|| Arc::new(MonitorCounter::new())),
                )
            }
            Err(_) => Arc::new(MonitorCounter::new()),
        }
    }

    // Outbound metrics are per target address.

    pub fn for_outbound_dispatched(
        &self,
        connection_id: &ConnectionId,
        target: &str,
    ) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Outbound,
            MetricType::Dispatched,
            Some(target),
        )
    }

    pub fn for_outbound_filtered(
        &self,
        connection_id: &ConnectionId,
        target: &str,
    ) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Outbound,
            MetricType::Filtered,
            Some(target),
        )
    }

    pub fn for_outbound_published(
        &self,
        connection_id: &ConnectionId,
        target: &str,
    ) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Outbound,
            MetricType::Published,
            Some(target),
        )
    }

    pub fn for_outbound_acknowledged(
        &self,
        connection_id: &ConnectionId,
        target: &str,
    ) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Outbound,
            MetricType::Acknowledged,
            Some(target),
        )
    }

    // Inbound metrics are per source address.

    pub fn for_inbound_consumed(
        &self,
        connection_id: &ConnectionId,
        source: &str,
    ) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Inbound,
            MetricType::Consumed,
            Some(source),
        )
    }

    pub fn for_inbound_acknowledged(
        &self,
        connection_id: &ConnectionId,
        source: &str,
    ) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Inbound,
            MetricType::Acknowledged,
            Some(source),
        )
    }

    pub fn for_inbound_mapped(
        &self,
        connection_id: &ConnectionId,
        source: &str,
    ) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Inbound,
            MetricType::Mapped,
            Some(source),
        )
    }

    pub fn for_inbound_enforced(
        &self,
        connection_id: &ConnectionId,
        source: &str,
    ) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Inbound,
            MetricType::Enforced,
            Some(source),
        )
    }

    pub fn for_inbound_dropped(
        &self,
        connection_id: &ConnectionId,
        source: &str,
    ) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Inbound,
            MetricType::Dropped,
            Some(source),
        )
    }

    // Response metrics have no address dimension.

    pub fn for_response_dispatched(&self, connection_id: &ConnectionId) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Response,
            MetricType::Dispatched,
            None,
        )
    }

    pub fn for_response_dropped(&self, connection_id: &ConnectionId) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Response,
            MetricType::Dropped,
            None,
        )
    }

    pub fn for_response_mapped(&self, connection_id: &ConnectionId) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Response,
            MetricType::Mapped,
            None,
        )
    }

    pub fn for_response_published(&self, connection_id: &ConnectionId) -> Arc<MonitorCounter> {
        self.counter(
            connection_id,
            MetricDirection::Response,
            MetricType::Published,
            None,
        )
    }
}
