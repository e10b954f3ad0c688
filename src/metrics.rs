use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one (event source, event name) pair.
#[derive(Default)]
struct EventCounters {
    sent: AtomicU64,
    send_failures: AtomicU64,
    processing_failures: AtomicU64,
    running: AtomicI64,
}

/// Tracks per-event delivery metrics for the running event sources.
///
/// In-process only; callers read them through [`EventMetrics::snapshot`].
#[derive(Clone, Default)]
pub struct EventMetrics {
    counters: Arc<DashMap<(String, String), Arc<EventCounters>>>,
}

impl EventMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, event_source: &str, event_name: &str) -> Arc<EventCounters> {
        self.counters
            .entry((event_source.to_string(), event_name.to_string()))
            .or_default()
            .clone()
    }

    /// Record an event that reached the bus
    pub fn event_sent(&self, event_source: &str, event_name: &str) {
        self.entry(event_source, event_name)
            .sent
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event the bus did not accept
    pub fn event_send_failed(&self, event_source: &str, event_name: &str) {
        self.entry(event_source, event_name)
            .send_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a payload that could not be turned into an event
    pub fn event_processing_failed(&self, event_source: &str, event_name: &str) {
        self.entry(event_source, event_name)
            .processing_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a connector task as started. The returned guard decrements the
    /// running gauge when dropped.
    pub fn service_started(&self, event_source: &str, event_name: &str) -> RunningGuard {
        let counters = self.entry(event_source, event_name);
        counters.running.fetch_add(1, Ordering::Relaxed);
        RunningGuard { counters }
    }

    /// Get snapshot of the counters for one event
    pub fn get(&self, event_source: &str, event_name: &str) -> Option<EventMetricsSnapshot> {
        self.counters
            .get(&(event_source.to_string(), event_name.to_string()))
            .map(|c| snapshot_of(event_source, event_name, &c))
    }

    /// Get snapshot of all counters, sorted by event source then event name
    pub fn snapshot(&self) -> Vec<EventMetricsSnapshot> {
        let mut all: Vec<_> = self
            .counters
            .iter()
            .map(|e| snapshot_of(&e.key().0, &e.key().1, e.value()))
            .collect();
        all.sort_by(|a, b| {
            (a.event_source.as_str(), a.event_name.as_str())
                .cmp(&(b.event_source.as_str(), b.event_name.as_str()))
        });
        all
    }
}

fn snapshot_of(event_source: &str, event_name: &str, c: &EventCounters) -> EventMetricsSnapshot {
    EventMetricsSnapshot {
        event_source: event_source.to_string(),
        event_name: event_name.to_string(),
        events_sent: c.sent.load(Ordering::Relaxed),
        send_failures: c.send_failures.load(Ordering::Relaxed),
        processing_failures: c.processing_failures.load(Ordering::Relaxed),
        running_services: c.running.load(Ordering::Relaxed),
    }
}

/// Keeps one connector counted as running.
pub struct RunningGuard {
    counters: Arc<EventCounters>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.counters.running.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventMetricsSnapshot {
    pub event_source: String,
    pub event_name: String,
    pub events_sent: u64,
    pub send_failures: u64,
    pub processing_failures: u64,
    pub running_services: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_event() {
        let metrics = EventMetrics::new();
        metrics.event_sent("ingress", "hook");
        metrics.event_sent("ingress", "hook");
        metrics.event_send_failed("ingress", "hook");
        metrics.event_processing_failed("ingress", "other");

        let hook = metrics.get("ingress", "hook").unwrap();
        assert_eq!(hook.events_sent, 2);
        assert_eq!(hook.send_failures, 1);
        assert_eq!(hook.processing_failures, 0);

        let other = metrics.get("ingress", "other").unwrap();
        assert_eq!(other.processing_failures, 1);
        assert!(metrics.get("ingress", "missing").is_none());
    }

    #[test]
    fn test_running_guard_tracks_services() {
        let metrics = EventMetrics::new();
        let first = metrics.service_started("ingress", "hook");
        let second = metrics.service_started("ingress", "hook");
        assert_eq!(metrics.get("ingress", "hook").unwrap().running_services, 2);

        drop(first);
        assert_eq!(metrics.get("ingress", "hook").unwrap().running_services, 1);
        drop(second);
        assert_eq!(metrics.get("ingress", "hook").unwrap().running_services, 0);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let metrics = EventMetrics::new();
        metrics.event_sent("b", "x");
        metrics.event_sent("a", "z");
        metrics.event_sent("a", "y");

        let keys: Vec<_> = metrics
            .snapshot()
            .into_iter()
            .map(|s| format!("{}/{}", s.event_source, s.event_name))
            .collect();
        assert_eq!(keys, vec!["a/y", "a/z", "b/x"]);
    }
}
