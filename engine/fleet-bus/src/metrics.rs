// Metrics primitives shared across the fleet

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for message movement through a bus instance
#[derive(Debug)]
pub struct BusMetrics {
    pub published_total: AtomicCounter,
    pub delivered_total: AtomicCounter,
    /// Published messages that matched no binding
    pub unroutable_total: AtomicCounter,
    pub handler_failures_total: AtomicCounter,
    pub active_consumers: AtomicGauge,
    pub uptime_start: Instant,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self {
            published_total: AtomicCounter::new(),
            delivered_total: AtomicCounter::new(),
            unroutable_total: AtomicCounter::new(),
            handler_failures_total: AtomicCounter::new(),
            active_consumers: AtomicGauge::new(),
            uptime_start: Instant::now(),
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.uptime_start.elapsed()
    }

    /// Share of handled messages whose handler failed, in percent
    pub fn failure_rate_percent(&self) -> u64 {
        let delivered = self.delivered_total.get();
        if delivered == 0 {
            return 0;
        }
        (self.handler_failures_total.get() * 100) / delivered
    }
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe atomic counter
#[derive(Debug)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe atomic gauge
#[derive(Debug)]
pub struct AtomicGauge {
    value: AtomicU64,
}

impl AtomicGauge {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for AtomicGauge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = AtomicCounter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
        counter.reset();
        assert_eq!(counter.get(), 0);

        let gauge = AtomicGauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_failure_rate() {
        let metrics = BusMetrics::new();
        assert_eq!(metrics.failure_rate_percent(), 0);

        metrics.delivered_total.add(20);
        metrics.handler_failures_total.add(5);
        assert_eq!(metrics.failure_rate_percent(), 25);
    }
}
