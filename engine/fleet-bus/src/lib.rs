//! FleetBus - topic exchange abstraction for cross-service fact events
//!
//! Services never talk to each other through a shared transaction. A fact change is
//! published once to a topic exchange under a semantic routing key, and every
//! interested service consumes it from its own durable queue. This crate provides the
//! bus contract ([`EventBus`]), an in-process implementation ([`InMemoryBus`]), a
//! Redis-backed implementation shared between processes ([`RedisBus`]), and the
//! exchange/queue names that make up the wire contract ([`topology`]).

pub mod bus;
pub mod delivery;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod redis_bus;
pub mod topology;

pub use bus::{publish_json, EventBus, MessageHandler, SubscriptionHandle};
pub use delivery::Delivery;
pub use error::{BusError, Result};
pub use exchange::{topic_matches, ExchangeKind, InMemoryBus};
pub use metrics::{AtomicCounter, AtomicGauge, BusMetrics};
pub use redis_bus::RedisBus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_ingest_queue_names() {
        assert_eq!(topology::ingest_queue(1), "ingest.queue.1");
        assert_eq!(topology::ingest_queue(3), "ingest.queue.3");
    }

    #[test]
    fn test_topic_matches_reexport() {
        assert!(topic_matches("user.*", "user.create"));
        assert!(!topic_matches("user.*", "device.create"));
    }
}
