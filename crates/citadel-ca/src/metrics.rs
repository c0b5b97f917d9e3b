//! Counter sink for rotation and prune events.
//!
//! The manager emits a small fixed set of counters:
//!
//! | Counter | Incremented |
//! |---------|-------------|
//! | `manager.x509_ca.prepare` | per X509 CA preparation attempt |
//! | `manager.x509_ca.activate` | per X509 CA activation |
//! | `manager.jwt_key.prepare` | per JWT key preparation attempt |
//! | `manager.jwt_key.activate` | per JWT key activation |
//! | `manager.bundle.prune` | per prune pass |
//! | `manager.bundle.pruned` | per prune pass that modified the bundle |

use std::collections::HashMap;
use std::sync::RwLock;

/// A sink for named counters.
pub trait Metrics: Send + Sync {
    /// Adds `value` to the counter named `name`.
    fn incr_counter(&self, name: &str, value: u64);
}

/// A metrics sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr_counter(&self, _name: &str, _value: u64) {}
}

/// An in-memory metrics collector for tests and simple deployments.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: RwLock<HashMap<String, u64>>,
}

impl InMemoryMetrics {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of a counter (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .expect("metrics lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl Metrics for InMemoryMetrics {
    fn incr_counter(&self, name: &str, value: u64) {
        let mut counters = self.counters.write().expect("metrics lock poisoned");
        *counters.entry(name.to_string()).or_insert(0) += value;
    }
}
