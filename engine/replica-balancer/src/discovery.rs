//! Replica discovery
//!
//! The replica set is resolved fresh on every routing decision. There is no cache and
//! no health loop: a replica that disappears from DNS stops receiving traffic on the
//! next request.

use std::net::IpAddr;

#[async_trait::async_trait]
pub trait ReplicaDiscovery: Send + Sync {
    /// Addresses of every live replica. Empty when none can be found.
    async fn discover(&self) -> Vec<String>;
}

/// Resolves a service DNS name to one address per replica
#[derive(Debug, Clone)]
pub struct DnsDiscovery {
    host: String,
}

impl DnsDiscovery {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait::async_trait]
impl ReplicaDiscovery for DnsDiscovery {
    async fn discover(&self) -> Vec<String> {
        match tokio::net::lookup_host((self.host.as_str(), 0)).await {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = Vec::new();
                for addr in addrs {
                    if !ips.contains(&addr.ip()) {
                        ips.push(addr.ip());
                    }
                }
                ips.into_iter().map(|ip| ip.to_string()).collect()
            }
            Err(e) => {
                tracing::error!("Error discovering replicas for {}: {}", self.host, e);
                Vec::new()
            }
        }
    }
}

/// Fixed replica list
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    replicas: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(replicas: Vec<String>) -> Self {
        Self { replicas }
    }
}

#[async_trait::async_trait]
impl ReplicaDiscovery for StaticDiscovery {
    async fn discover(&self) -> Vec<String> {
        self.replicas.clone()
    }
}

/// `host:port` authority for a discovered address, bracketing IPv6 literals
pub fn authority(address: &str, port: u16) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, port),
        _ => format!("{}:{}", address, port),
    }
}
