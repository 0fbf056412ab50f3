//! Configuration for the replica balancer

use crate::error::{BalancerError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Logical service name used in log lines and the 503 body
    pub service_name: String,
    /// DNS name resolving to every live replica
    pub discovery_host: String,
    /// Fixed replica list; when set, DNS discovery is not used
    pub static_replicas: Option<Vec<String>>,
    /// Port the monitoring replicas serve their REST API on
    pub replica_port: u16,
    /// Position-indexed traffic split
    pub weights: Vec<u32>,
    pub listen_addr: String,
    pub upstream_timeout_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            service_name: "monitoring-microservice".to_string(),
            discovery_host: "tasks.monitoring-microservice".to_string(),
            static_replicas: None,
            replica_port: 8081,
            weights: vec![50, 30, 20],
            listen_addr: "0.0.0.0:8080".to_string(),
            upstream_timeout_ms: 30_000,
        }
    }
}

impl BalancerConfig {
    pub fn listen_addr(&self) -> std::result::Result<std::net::SocketAddr, std::net::AddrParseError> {
        self.listen_addr.parse()
    }

    pub fn upstream_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.weights.is_empty() || self.weights.iter().all(|w| *w == 0) {
            return Err(invalid("weights must contain a non-zero entry"));
        }
        if self.replica_port == 0 {
            return Err(invalid("replica port must be non-zero"));
        }
        if self.upstream_timeout_ms == 0 {
            return Err(invalid("upstream timeout must be positive"));
        }
        self.listen_addr()
            .map_err(|e| invalid(&format!("listen address {}: {}", self.listen_addr, e)))?;
        Ok(())
    }
}

fn invalid(message: &str) -> BalancerError {
    BalancerError::InvalidConfig { message: message.to_string() }
}
