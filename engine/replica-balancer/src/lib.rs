//! ReplicaBalancer - weighted traffic split across monitoring replicas
//!
//! Two paths share one [`WeightedSelector`]:
//! - HTTP requests are proxied to a replica chosen per request ([`proxy`])
//! - measurements are moved from the central queue to per-replica ingest queues
//!   ([`queue_router`])
//!
//! Replicas are rediscovered on every decision ([`discovery`]).

pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod queue_router;
pub mod selector;

pub use config::BalancerConfig;
pub use discovery::{DnsDiscovery, ReplicaDiscovery, StaticDiscovery};
pub use error::{BalancerError, Result};
pub use metrics::BalancerMetrics;
pub use proxy::{create_routes, HttpProxy};
pub use queue_router::QueueRouter;
pub use selector::{WeightedSelector, DEFAULT_WEIGHTS};

use std::sync::Arc;

/// Discovery configured by `config`: the static list when present, DNS otherwise
pub fn discovery_from_config(config: &BalancerConfig) -> Arc<dyn ReplicaDiscovery> {
    match &config.static_replicas {
        Some(replicas) => Arc::new(StaticDiscovery::new(replicas.clone())),
        None => Arc::new(DnsDiscovery::new(config.discovery_host.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_replicas_take_precedence() {
        let config = BalancerConfig {
            static_replicas: Some(vec!["10.0.0.1".to_string()]),
            ..BalancerConfig::default()
        };
        assert_eq!(discovery_from_config(&config).discover().await, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn test_default_weights_match_config() {
        assert_eq!(BalancerConfig::default().weights, DEFAULT_WEIGHTS.to_vec());
    }
}
