//! Redis-backed [`EventBus`] for fleets split across processes.
//!
//! Topology is kept in Redis so every process sees the same exchanges, queues and
//! bindings:
//! - `<prefix>:exchanges` hash: exchange name -> kind
//! - `<prefix>:queues` hash: queue name -> durable flag
//! - `<prefix>:bindings:<exchange>` set: JSON `[queue, pattern]` pairs
//! - `<prefix>:queue:<name>` list: pending deliveries, pushed left and popped right
//!
//! Consumers of the same queue in different processes compete for its messages.
//! Within one process a queue still has at most one consumer.

use crate::bus::{EventBus, MessageHandler, SubscriptionHandle};
use crate::delivery::{Delivery, CONTENT_TYPE_JSON};
use crate::error::BusError;
use crate::exchange::{binding_matches, ExchangeKind};
use crate::metrics::BusMetrics;
use crate::Result;
use dashmap::DashSet;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_KEY_PREFIX: &str = "fleet";

/// Seconds a consumer blocks on an empty queue before polling again
const POLL_TIMEOUT_SECS: u64 = 1;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Event bus backed by Redis lists
pub struct RedisBus {
    client: Client,
    connection: ConnectionManager,
    prefix: String,
    consuming: Arc<DashSet<String>>,
    metrics: Arc<BusMetrics>,
}

impl RedisBus {
    /// Connect with the default key prefix
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_prefix(url, DEFAULT_KEY_PREFIX).await
    }

    pub async fn connect_with_prefix(url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        tracing::info!("FleetBus connected to Redis (key prefix {})", prefix);

        Ok(Self {
            client,
            connection,
            prefix: prefix.to_string(),
            consuming: Arc::new(DashSet::new()),
            metrics: Arc::new(BusMetrics::new()),
        })
    }

    /// Messages waiting in a queue
    pub async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let depth: u64 = conn.llen(queue_key(&self.prefix, queue)).await?;
        Ok(depth)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.consuming.contains(queue)
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.hexists(queues_key(&self.prefix), queue).await?;
        Ok(exists)
    }

    async fn enqueue(&self, queue: &str, encoded: &str) -> Result<()> {
        if !self.queue_exists(queue).await? {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }
        let mut conn = self.connection.clone();
        let _: () = conn.lpush(queue_key(&self.prefix, queue), encoded).await?;
        Ok(())
    }

    async fn exchange_kind(&self, exchange: &str) -> Result<Option<ExchangeKind>> {
        let mut conn = self.connection.clone();
        let tag: Option<String> = conn.hget(exchanges_key(&self.prefix), exchange).await?;
        Ok(tag.as_deref().and_then(parse_kind))
    }
}

#[async_trait::async_trait]
impl EventBus for RedisBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut conn = self.connection.clone();
        let created: bool = conn.hset_nx(exchanges_key(&self.prefix), name, kind_tag(kind)).await?;
        if created {
            tracing::debug!("FleetBus declared {:?} exchange {} in Redis", kind, name);
            return Ok(());
        }

        match self.exchange_kind(name).await? {
            Some(existing) if existing == kind => Ok(()),
            _ => Err(BusError::ExchangeKindMismatch { name: name.to_string() }),
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        let mut conn = self.connection.clone();
        let created: bool = conn.hset_nx(queues_key(&self.prefix), name, durable).await?;
        if created {
            tracing::debug!("FleetBus declared queue {} in Redis (durable: {})", name, durable);
        }
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        if self.exchange_kind(exchange).await?.is_none() {
            return Err(BusError::UnknownExchange(exchange.to_string()));
        }
        if !self.queue_exists(queue).await? {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }

        let mut conn = self.connection.clone();
        let added: u64 = conn
            .sadd(bindings_key(&self.prefix, exchange), encode_binding(queue, pattern)?)
            .await?;
        if added > 0 {
            tracing::debug!("FleetBus bound queue {} to {} with {}", queue, exchange, pattern);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()> {
        let kind = self
            .exchange_kind(exchange)
            .await?
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        self.metrics.published_total.inc();

        let mut conn = self.connection.clone();
        let members: Vec<String> = conn.smembers(bindings_key(&self.prefix, exchange)).await?;
        let bindings: Vec<(String, String)> =
            members.iter().filter_map(|member| decode_binding(member)).collect();

        let targets = route(kind, &bindings, routing_key);
        if targets.is_empty() {
            self.metrics.unroutable_total.inc();
            tracing::debug!(
                "FleetBus dropped unroutable message on {} with key {}",
                exchange,
                routing_key
            );
            return Ok(());
        }

        let mut delivery = Delivery::new(exchange, routing_key, payload);
        delivery.content_type = Some(CONTENT_TYPE_JSON.to_string());
        let encoded = serde_json::to_string(&delivery)?;

        let mut failed = Vec::new();
        for queue in targets {
            if let Err(e) = self.enqueue(&queue, &encoded).await {
                tracing::warn!("FleetBus could not enqueue on {}: {}", queue, e);
                failed.push(queue);
            }
        }
        if !failed.is_empty() {
            return Err(BusError::PartialDelivery { exchange: exchange.to_string(), failed });
        }
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, delivery: Delivery) -> Result<()> {
        self.metrics.published_total.inc();
        let encoded = serde_json::to_string(&delivery)?;
        self.enqueue(queue, &encoded).await
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle> {
        if !self.queue_exists(queue).await? {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }
        if !self.consuming.insert(queue.to_string()) {
            return Err(BusError::QueueAlreadyConsumed(queue.to_string()));
        }

        // BRPOP blocks its connection, so every consumer gets its own
        let mut conn = match self.client.get_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                self.consuming.remove(queue);
                return Err(e.into());
            }
        };

        self.metrics.active_consumers.inc();
        let guard = ConsumerGuard {
            queue: queue.to_string(),
            consuming: self.consuming.clone(),
            metrics: self.metrics.clone(),
        };

        let client = self.client.clone();
        let metrics = self.metrics.clone();
        let key = queue_key(&self.prefix, queue);
        let queue_name = queue.to_string();

        tracing::info!("FleetBus consumer started on Redis queue {}", queue_name);

        let task_queue = queue_name.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            loop {
                let popped = redis::cmd("BRPOP")
                    .arg(&key)
                    .arg(POLL_TIMEOUT_SECS)
                    .query_async::<_, Option<(String, String)>>(&mut conn)
                    .await;

                let raw = match popped {
                    Ok(Some((_, raw))) => raw,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!("Redis consumer on {} lost its connection: {}", task_queue, e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        match client.get_async_connection().await {
                            Ok(fresh) => conn = fresh,
                            Err(e) => tracing::warn!("Reconnect for {} failed: {}", task_queue, e),
                        }
                        continue;
                    }
                };

                metrics.delivered_total.inc();
                let delivery: Delivery = match serde_json::from_str(&raw) {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        metrics.handler_failures_total.inc();
                        tracing::error!("Undecodable envelope on {}, dropping: {}", task_queue, e);
                        continue;
                    }
                };

                if let Err(e) = handler.handle(delivery).await {
                    metrics.handler_failures_total.inc();
                    tracing::error!("Handler on queue {} failed, dropping message: {:#}", task_queue, e);
                }
            }
        });

        Ok(SubscriptionHandle::new(queue_name, task))
    }

    fn metrics(&self) -> Arc<BusMetrics> {
        self.metrics.clone()
    }
}

/// Releases the in-process consumer claim when the task ends or is aborted
struct ConsumerGuard {
    queue: String,
    consuming: Arc<DashSet<String>>,
    metrics: Arc<BusMetrics>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        if self.consuming.remove(&self.queue).is_some() {
            self.metrics.active_consumers.dec();
        }
    }
}

fn exchanges_key(prefix: &str) -> String {
    format!("{}:exchanges", prefix)
}

fn queues_key(prefix: &str) -> String {
    format!("{}:queues", prefix)
}

fn bindings_key(prefix: &str, exchange: &str) -> String {
    format!("{}:bindings:{}", prefix, exchange)
}

fn queue_key(prefix: &str, queue: &str) -> String {
    format!("{}:queue:{}", prefix, queue)
}

fn kind_tag(kind: ExchangeKind) -> &'static str {
    match kind {
        ExchangeKind::Topic => "topic",
        ExchangeKind::Direct => "direct",
        ExchangeKind::Fanout => "fanout",
    }
}

fn parse_kind(tag: &str) -> Option<ExchangeKind> {
    match tag {
        "topic" => Some(ExchangeKind::Topic),
        "direct" => Some(ExchangeKind::Direct),
        "fanout" => Some(ExchangeKind::Fanout),
        _ => None,
    }
}

fn encode_binding(queue: &str, pattern: &str) -> Result<String> {
    Ok(serde_json::to_string(&(queue, pattern))?)
}

fn decode_binding(member: &str) -> Option<(String, String)> {
    serde_json::from_str(member).ok()
}

/// Distinct queues whose binding accepts `routing_key`, in binding order
fn route(kind: ExchangeKind, bindings: &[(String, String)], routing_key: &str) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for (queue, pattern) in bindings {
        if binding_matches(kind, pattern, routing_key) && !targets.contains(queue) {
            targets.push(queue.clone());
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(queue: &str, pattern: &str) -> (String, String) {
        (queue.to_string(), pattern.to_string())
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(queues_key("fleet"), "fleet:queues");
        assert_eq!(queue_key("fleet", "ingest.queue.1"), "fleet:queue:ingest.queue.1");
        assert_eq!(bindings_key("fleet", "user.events.exchange"), "fleet:bindings:user.events.exchange");
    }

    #[test]
    fn test_kind_tags_parse_back() {
        for kind in [ExchangeKind::Topic, ExchangeKind::Direct, ExchangeKind::Fanout] {
            assert_eq!(parse_kind(kind_tag(kind)), Some(kind));
        }
        assert_eq!(parse_kind("headers"), None);
    }

    #[test]
    fn test_binding_member_survives_dots_and_wildcards() {
        let member = encode_binding("device.user.queue", "user.#").unwrap();
        assert_eq!(decode_binding(&member), Some(binding("device.user.queue", "user.#")));
        assert_eq!(decode_binding("garbage"), None);
    }

    #[test]
    fn test_route_deduplicates_queues() {
        let bindings = vec![
            binding("device.device.queue", "device.create"),
            binding("device.device.queue", "device.*"),
            binding("monitoring.device.queue", "device.delete"),
        ];

        assert_eq!(route(ExchangeKind::Topic, &bindings, "device.create"), vec!["device.device.queue"]);
        assert_eq!(
            route(ExchangeKind::Topic, &bindings, "device.delete"),
            vec!["device.device.queue", "monitoring.device.queue"]
        );
        assert!(route(ExchangeKind::Direct, &bindings, "device.update").is_empty());
        assert_eq!(route(ExchangeKind::Fanout, &bindings, "").len(), 2);
    }

    #[test]
    fn test_envelope_keeps_headers_and_body() {
        let delivery = Delivery::new("device.measurements.exchange", "device.measurement", vec![0, 255, 7])
            .with_header("__TypeId__", "DeviceMeasurementMessage");

        let encoded = serde_json::to_string(&delivery).unwrap();
        let decoded: Delivery = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, delivery);
    }
}
