//! Balancer counters

use dashmap::DashMap;
use fleet_bus::AtomicCounter;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct BalancerMetrics {
    pub requests_forwarded: AtomicCounter,
    pub requests_rejected_no_replica: AtomicCounter,
    pub upstream_failures: AtomicCounter,
    pub messages_dropped: AtomicCounter,
    routed: DashMap<String, Arc<AtomicCounter>>,
}

impl BalancerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_routed(&self, queue: &str) {
        self.routed.entry(queue.to_string()).or_default().inc();
    }

    /// Messages routed to `queue` so far
    pub fn routed_to(&self, queue: &str) -> u64 {
        self.routed.get(queue).map(|c| c.get()).unwrap_or(0)
    }

    pub fn routed_total(&self) -> u64 {
        self.routed.iter().map(|c| c.get()).sum()
    }

    /// One-line summary for periodic logging
    pub fn summary(&self) -> String {
        let mut per_queue: Vec<(String, u64)> =
            self.routed.iter().map(|e| (e.key().clone(), e.value().get())).collect();
        per_queue.sort();
        format!(
            "forwarded={} no_replica={} upstream_failures={} dropped={} routed={:?}",
            self.requests_forwarded.get(),
            self.requests_rejected_no_replica.get(),
            self.upstream_failures.get(),
            self.messages_dropped.get(),
            per_queue
        )
    }
}
