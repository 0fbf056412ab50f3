//! Fact replication between independently deployed services
//!
//! The owning service publishes CREATE/DELETE events through [`FactPublisher`]; every
//! other service keeps a read-only copy via a [`FactConsumer`] bound to its own queue.
//! Consumers are idempotent, so duplicate and out-of-order deliveries converge on the
//! same local state.

pub mod config;
pub mod consumer;
pub mod error;
pub mod messages;
pub mod ownership;
pub mod propagation;
pub mod publisher;
pub mod store;

pub use config::{PropagationConfig, ReplicationConfig};
pub use consumer::{ApplyHook, ApplyOutcome, ConflictPolicy, FactConsumer};
pub use error::{ReplicationError, Result};
pub use messages::{
    DeviceEventMessage, DeviceRecord, EventType, UserDeviceLink, UserEventMessage, UserRecord,
};
pub use ownership::{AssignOutcome, OwnershipLinks};
pub use propagation::RemotePropagator;
pub use publisher::FactPublisher;
pub use store::{LinkStore, MemoryLinkStore, MemoryReplicaStore, PgFactStore, ReplicaStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_skips_conflicts() {
        let config = ReplicationConfig::default();
        assert_eq!(config.user_policy, ConflictPolicy::Skip);
        assert!(config.propagation.base_url.is_none());
    }
}
