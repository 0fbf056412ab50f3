//! Configuration for fact replication

use crate::consumer::ConflictPolicy;
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};

/// Replication settings for one consuming service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Service name used to derive its private queues (`{service}.user.queue`, ...)
    pub service_name: String,
    pub user_policy: ConflictPolicy,
    pub device_policy: ConflictPolicy,
    pub propagation: PropagationConfig,
}

/// Outbound HTTP replication to a peer service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Peer base URL, e.g. `http://device-microservice:8080`. `None` disables propagation.
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            service_name: "monitoring".to_string(),
            user_policy: ConflictPolicy::Skip,
            device_policy: ConflictPolicy::Skip,
            propagation: PropagationConfig::default(),
        }
    }
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self { base_url: None, timeout_ms: 5000 }
    }
}

impl ReplicationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(invalid("service name must not be empty".to_string()));
        }
        if let Some(base_url) = &self.propagation.base_url {
            reqwest::Url::parse(base_url)
                .map_err(|e| invalid(format!("propagation url {}: {}", base_url, e)))?;
        }
        if self.propagation.timeout_ms == 0 {
            return Err(invalid("propagation timeout must be positive".to_string()));
        }
        Ok(())
    }
}

fn invalid(message: String) -> ReplicationError {
    ReplicationError::InvalidConfig { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let mut config = ReplicationConfig::default();
        assert!(config.validate().is_ok());

        config.propagation.base_url = Some("http://device-microservice:8080".to_string());
        assert!(config.validate().is_ok());

        config.propagation.base_url = Some("device-microservice".to_string());
        assert!(matches!(config.validate(), Err(ReplicationError::InvalidConfig { .. })));

        let config = ReplicationConfig { service_name: " ".to_string(), ..ReplicationConfig::default() };
        assert!(config.validate().is_err());
    }
}
