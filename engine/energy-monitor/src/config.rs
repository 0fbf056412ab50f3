//! Configuration for a monitoring replica

use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Ordinal of this replica; selects `ingest.queue.{replica_id}`
    pub replica_id: usize,
    /// Hourly total (kWh) above which an alert fires
    pub threshold: f64,
    pub rest_listen_addr: String,
    /// Per-topic buffer of the real-time hub
    pub realtime_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            replica_id: 1,
            threshold: 100.0,
            rest_listen_addr: "0.0.0.0:8081".to_string(),
            realtime_capacity: 256,
        }
    }
}

impl MonitorConfig {
    pub fn rest_listen_addr(&self) -> std::result::Result<std::net::SocketAddr, std::net::AddrParseError> {
        self.rest_listen_addr.parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.replica_id == 0 {
            return Err(invalid("replica id must be at least 1".to_string()));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(invalid(format!("threshold {} is not a usable kWh value", self.threshold)));
        }
        if self.realtime_capacity == 0 {
            return Err(invalid("realtime capacity must be positive".to_string()));
        }
        self.rest_listen_addr()
            .map_err(|e| invalid(format!("listen address {}: {}", self.rest_listen_addr, e)))?;
        Ok(())
    }
}

fn invalid(message: String) -> MonitorError {
    MonitorError::InvalidConfig { message }
}
