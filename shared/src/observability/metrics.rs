//! Application metrics collection and reporting

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Simple metrics collector
pub struct MetricsCollector {
    counters: Arc<RwLock<HashMap<String, AtomicU64>>>,
    gauges: Arc<RwLock<HashMap<String, AtomicU64>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(HashMap::new())),
            gauges: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Increment a counter
    pub fn increment_counter(&self, name: &str, value: u64) {
        let counters = self.counters.read();
        if let Some(counter) = counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
        } else {
            drop(counters);
            // Another writer may have inserted it between the two locks
            self.counters
                .write()
                .entry(name.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(value, Ordering::Relaxed);
        }
    }

    /// Increment both the total and the `name:label` series
    pub fn increment_labeled(&self, name: &str, label: &str) {
        self.increment_counter(name, 1);
        self.increment_counter(&labeled(name, label), 1);
    }

    /// Set a gauge value
    pub fn set_gauge(&self, name: &str, value: u64) {
        let gauges = self.gauges.read();
        if let Some(gauge) = gauges.get(name) {
            gauge.store(value, Ordering::Relaxed);
        } else {
            drop(gauges);
            self.gauges
                .write()
                .entry(name.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .store(value, Ordering::Relaxed);
        }
    }

    /// Get counter value
    pub fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters
            .read()
            .get(name)
            .map(|counter| counter.load(Ordering::Relaxed))
    }

    /// Get gauge value
    pub fn get_gauge(&self, name: &str) -> Option<u64> {
        self.gauges
            .read()
            .get(name)
            .map(|gauge| gauge.load(Ordering::Relaxed))
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let gauges = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot { counters, gauges }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Series name for a labeled counter
pub fn labeled(name: &str, label: &str) -> String {
    format!("{}:{}", name, label)
}

/// Snapshot of all metrics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
}

/// Common metric names
pub mod metric_names {
    // Ingestion
    pub const EVENTS_PUBLISHED_TOTAL: &str = "events_published_total";
    pub const EVENTS_PUBLISH_FAILED_TOTAL: &str = "events_publish_failed_total";
    pub const EVENTS_REJECTED_TOTAL: &str = "events_rejected_total";

    // Consumption
    pub const EVENTS_CONSUMED_TOTAL: &str = "events_consumed_total";
    pub const CONSUMER_ERRORS_TOTAL: &str = "consumer_errors_total";
    pub const CONSUMER_LOOPS_ACTIVE: &str = "consumer_loops_active";

    // Lifecycle
    pub const LIFECYCLE_TRANSITIONS_TOTAL: &str = "lifecycle_transitions_total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let metrics = MetricsCollector::new();

        metrics.increment_counter("test_counter", 1);
        assert_eq!(metrics.get_counter("test_counter"), Some(1));

        metrics.increment_counter("test_counter", 5);
        assert_eq!(metrics.get_counter("test_counter"), Some(6));
    }

    #[test]
    fn test_labeled_counter() {
        let metrics = MetricsCollector::new();

        metrics.increment_labeled(metric_names::EVENTS_CONSUMED_TOTAL, "movie-events");
        metrics.increment_labeled(metric_names::EVENTS_CONSUMED_TOTAL, "user-events");

        assert_eq!(metrics.get_counter("events_consumed_total"), Some(2));
        assert_eq!(
            metrics.get_counter("events_consumed_total:movie-events"),
            Some(1)
        );
    }

    #[test]
    fn test_gauge() {
        let metrics = MetricsCollector::new();

        metrics.set_gauge("test_gauge", 100);
        assert_eq!(metrics.get_gauge("test_gauge"), Some(100));

        metrics.set_gauge("test_gauge", 50);
        assert_eq!(metrics.get_gauge("test_gauge"), Some(50));
    }

    #[test]
    fn test_snapshot() {
        let metrics = MetricsCollector::new();

        metrics.increment_counter("counter1", 10);
        metrics.set_gauge("gauge1", 42);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counters.get("counter1"), Some(&10));
        assert_eq!(snapshot.gauges.get("gauge1"), Some(&42));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["counters"]["counter1"], 10);
    }
}
