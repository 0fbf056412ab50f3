//! In-process exchange/queue implementation of [`EventBus`].
//!
//! Mirrors the broker semantics the services rely on:
//! - exchanges route by kind (topic patterns, exact key, or fanout)
//! - queues are buffers that outlive their consumers, so messages published before a
//!   consumer subscribes are still delivered
//! - a queue receives one copy of a message even if several of its bindings match
//! - a message that matches no binding is dropped
//!
//! Each subscribed queue is drained by its own tokio task; there is no lock shared
//! between consumers.

use crate::bus::{EventBus, MessageHandler, SubscriptionHandle};
use crate::delivery::Delivery;
use crate::error::BusError;
use crate::metrics::BusMetrics;
use crate::Result;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing key matched against `.`-separated patterns with `*` and `#`
    Topic,
    /// Routing key must equal the binding key
    Direct,
    /// Every bound queue gets every message
    Fanout,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

struct QueueSlot {
    durable: bool,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    consuming: Arc<AtomicBool>,
    enqueued: AtomicU64,
    consumed: Arc<AtomicU64>,
}

/// In-process topic exchange bus
pub struct InMemoryBus {
    exchanges: DashMap<String, ExchangeKind>,
    queues: DashMap<String, QueueSlot>,
    bindings: RwLock<Vec<Binding>>,
    metrics: Arc<BusMetrics>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            bindings: RwLock::new(Vec::new()),
            metrics: Arc::new(BusMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<BusMetrics> {
        self.metrics.clone()
    }

    /// Messages enqueued but not yet taken by a consumer
    pub fn queue_depth(&self, queue: &str) -> Option<u64> {
        self.queues.get(queue).map(|slot| {
            slot.enqueued.load(Ordering::Relaxed).saturating_sub(slot.consumed.load(Ordering::Relaxed))
        })
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.queues.get(queue).map(|slot| slot.durable)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.queues.get(queue).is_some_and(|slot| slot.consuming.load(Ordering::Acquire))
    }

    fn enqueue(&self, queue: &str, delivery: Delivery) -> Result<()> {
        let slot = self.queues.get(queue).ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
        slot.sender.send(delivery).map_err(|_| BusError::QueueClosed(queue.to_string()))?;
        slot.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queues that should receive a message published to `exchange` with `routing_key`
    fn route(&self, exchange: &str, kind: ExchangeKind, routing_key: &str) -> Vec<String> {
        let bindings = self.bindings.read();
        let mut targets: Vec<String> = Vec::new();
        for binding in bindings.iter().filter(|b| b.exchange == exchange) {
            if binding_matches(kind, &binding.pattern, routing_key) && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}

#[async_trait::async_trait]
impl EventBus for InMemoryBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        if let Some(existing) = self.exchanges.get(name) {
            if *existing != kind {
                return Err(BusError::ExchangeKindMismatch { name: name.to_string() });
            }
            return Ok(());
        }
        self.exchanges.insert(name.to_string(), kind);
        tracing::debug!("FleetBus declared {:?} exchange {}", kind, name);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        if self.queues.contains_key(name) {
            return Ok(());
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.queues.insert(
            name.to_string(),
            QueueSlot {
                durable,
                sender,
                receiver: Arc::new(Mutex::new(receiver)),
                consuming: Arc::new(AtomicBool::new(false)),
                enqueued: AtomicU64::new(0),
                consumed: Arc::new(AtomicU64::new(0)),
            },
        );
        tracing::debug!("FleetBus declared queue {} (durable: {})", name, durable);
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BusError::UnknownExchange(exchange.to_string()));
        }
        if !self.queues.contains_key(queue) {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }

        let mut bindings = self.bindings.write();
        let exists = bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            });
            tracing::debug!("FleetBus bound queue {} to {} with {}", queue, exchange, pattern);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()> {
        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        self.metrics.published_total.inc();

        let targets = self.route(exchange, kind, routing_key);
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
        delivery.content_type = Some(crate::delivery::CONTENT_TYPE_JSON.to_string());
        let mut failed = Vec::new();
        for queue in targets {
            if let Err(e) = self.enqueue(&queue, delivery.clone()) {
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
        self.enqueue(queue, delivery)
    }

    fn metrics(&self) -> Arc<BusMetrics> {
        self.metrics.clone()
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle> {
        let slot = self.queues.get(queue).ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;

        if slot.consuming.swap(true, Ordering::AcqRel) {
            return Err(BusError::QueueAlreadyConsumed(queue.to_string()));
        }

        let receiver = slot.receiver.clone();
        let consumed = slot.consumed.clone();
        let guard = ConsumerGuard { flag: slot.consuming.clone(), metrics: self.metrics.clone() };
        let metrics = self.metrics.clone();
        let queue_name = queue.to_string();
        drop(slot);

        metrics.active_consumers.inc();
        tracing::info!("FleetBus consumer started on queue {}", queue_name);

        let task_queue = queue_name.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            loop {
                let next = {
                    let mut rx = receiver.lock().await;
                    rx.recv().await
                };
                let Some(delivery) = next else {
                    tracing::info!("FleetBus queue {} closed, consumer exiting", task_queue);
                    break;
                };
                consumed.fetch_add(1, Ordering::Relaxed);
                metrics.delivered_total.inc();

                if let Err(e) = handler.handle(delivery).await {
                    metrics.handler_failures_total.inc();
                    tracing::error!("Handler on queue {} failed, dropping message: {:#}", task_queue, e);
                }
            }
        });

        Ok(SubscriptionHandle::new(queue_name, task))
    }
}

/// Releases the single-consumer claim on a queue when its task ends or is aborted
struct ConsumerGuard {
    flag: Arc<AtomicBool>,
    metrics: Arc<BusMetrics>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.metrics.active_consumers.dec();
    }
}

/// Whether a binding with `pattern` on an exchange of `kind` accepts `routing_key`
pub(crate) fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Fanout => true,
    }
}

/// AMQP topic matching: words are `.`-separated, `*` matches exactly one word and
/// `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() { Vec::new() } else { routing_key.split('.').collect() };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;

    struct Recorder {
        seen: SyncMutex<Vec<Delivery>>,
        fail_on: Option<Vec<u8>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self { seen: SyncMutex::new(Vec::new()), fail_on: None })
        }

        fn failing_on(body: &[u8]) -> Arc<Self> {
            Arc::new(Self { seen: SyncMutex::new(Vec::new()), fail_on: Some(body.to_vec()) })
        }

        fn bodies(&self) -> Vec<Vec<u8>> {
            self.seen.lock().iter().map(|d| d.body.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
            if self.fail_on.as_deref() == Some(delivery.body.as_slice()) {
                anyhow::bail!("poison message");
            }
            self.seen.lock().push(delivery);
            Ok(())
        }
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        for _ in 0..100 {
            if recorder.seen.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn bus_with_queue(queue: &str, exchange: &str, pattern: &str) -> InMemoryBus {
        let bus = InMemoryBus::new();
        bus.declare_exchange(exchange, ExchangeKind::Topic).await.unwrap();
        bus.declare_queue(queue, true).await.unwrap();
        bus.bind(queue, exchange, pattern).await.unwrap();
        bus
    }

    #[test]
    fn test_topic_patterns() {
        assert!(topic_matches("user.create", "user.create"));
        assert!(!topic_matches("user.create", "user.delete"));
        assert!(topic_matches("user.*", "user.delete"));
        assert!(!topic_matches("user.*", "user.delete.extra"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("device.#", "device"));
        assert!(topic_matches("*.measurement", "device.measurement"));
        assert!(topic_matches("#.measurement", "a.b.measurement"));
        assert!(!topic_matches("*", ""));
    }

    #[tokio::test]
    async fn test_messages_buffer_until_consumer_subscribes() {
        let bus = bus_with_queue("svc.user.queue", "user.events.exchange", "user.*").await;

        bus.publish("user.events.exchange", "user.create", b"one".to_vec()).await.unwrap();
        bus.publish("user.events.exchange", "user.delete", b"two".to_vec()).await.unwrap();
        assert_eq!(bus.queue_depth("svc.user.queue"), Some(2));

        let recorder = Recorder::new();
        let _handle = bus.subscribe("svc.user.queue", recorder.clone()).await.unwrap();
        wait_for(&recorder, 2).await;

        assert_eq!(recorder.bodies(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(bus.queue_depth("svc.user.queue"), Some(0));
    }

    #[tokio::test]
    async fn test_unroutable_message_is_dropped() {
        let bus = bus_with_queue("svc.user.queue", "user.events.exchange", "user.create").await;

        bus.publish("user.events.exchange", "user.delete", b"x".to_vec()).await.unwrap();

        assert_eq!(bus.queue_depth("svc.user.queue"), Some(0));
        assert_eq!(bus.metrics().unroutable_total.get(), 1);
    }

    #[tokio::test]
    async fn test_one_copy_per_queue_even_with_overlapping_bindings() {
        let bus = bus_with_queue("svc.device.queue", "device.events.exchange", "device.create").await;
        bus.bind("svc.device.queue", "device.events.exchange", "device.*").await.unwrap();

        bus.publish("device.events.exchange", "device.create", b"d".to_vec()).await.unwrap();

        assert_eq!(bus.queue_depth("svc.device.queue"), Some(1));
    }

    #[tokio::test]
    async fn test_each_bound_queue_gets_its_own_copy() {
        let bus = bus_with_queue("a.user.queue", "user.events.exchange", "user.create").await;
        bus.declare_queue("b.user.queue", true).await.unwrap();
        bus.bind("b.user.queue", "user.events.exchange", "user.create").await.unwrap();

        bus.publish("user.events.exchange", "user.create", b"u".to_vec()).await.unwrap();

        assert_eq!(bus.queue_depth("a.user.queue"), Some(1));
        assert_eq!(bus.queue_depth("b.user.queue"), Some(1));
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_consumer() {
        let bus = bus_with_queue("q", "x", "#").await;
        let recorder = Recorder::failing_on(b"bad");
        let _handle = bus.subscribe("q", recorder.clone()).await.unwrap();

        bus.publish("x", "k", b"bad".to_vec()).await.unwrap();
        bus.publish("x", "k", b"good".to_vec()).await.unwrap();
        wait_for(&recorder, 1).await;

        assert_eq!(recorder.bodies(), vec![b"good".to_vec()]);
        assert_eq!(bus.metrics().handler_failures_total.get(), 1);
    }

    #[tokio::test]
    async fn test_second_consumer_is_rejected() {
        let bus = bus_with_queue("q", "x", "#").await;
        let _first = bus.subscribe("q", Recorder::new()).await.unwrap();

        let second = bus.subscribe("q", Recorder::new()).await;
        assert!(matches!(second, Err(BusError::QueueAlreadyConsumed(_))));
    }

    #[tokio::test]
    async fn test_send_to_queue_preserves_delivery() {
        let bus = InMemoryBus::new();
        bus.declare_queue("ingest.queue.2", true).await.unwrap();

        let original = Delivery::new("device.measurements.exchange", "device.measurement", vec![0, 159, 146, 150])
            .with_header("__TypeId__", "DeviceMeasurementMessage");
        bus.send_to_queue("ingest.queue.2", original.clone()).await.unwrap();

        let recorder = Recorder::new();
        let _handle = bus.subscribe("ingest.queue.2", recorder.clone()).await.unwrap();
        wait_for(&recorder, 1).await;

        assert_eq!(recorder.seen.lock()[0], original);
    }

    #[tokio::test]
    async fn test_unknown_targets_are_errors() {
        let bus = InMemoryBus::new();
        assert!(matches!(
            bus.publish("missing", "k", Vec::new()).await,
            Err(BusError::UnknownExchange(_))
        ));
        assert!(matches!(
            bus.send_to_queue("missing", Delivery::new("", "", Vec::new())).await,
            Err(BusError::UnknownQueue(_))
        ));
        bus.declare_exchange("x", ExchangeKind::Topic).await.unwrap();
        assert!(matches!(
            bus.declare_exchange("x", ExchangeKind::Fanout).await,
            Err(BusError::ExchangeKindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_queue_does_not_block_remaining_targets() {
        let bus = bus_with_queue("a.user.queue", "user.events.exchange", "user.create").await;
        bus.declare_queue("b.user.queue", true).await.unwrap();
        bus.bind("b.user.queue", "user.events.exchange", "user.create").await.unwrap();
        bus.queues.remove("a.user.queue");

        let result = bus.publish("user.events.exchange", "user.create", b"u".to_vec()).await;

        match result {
            Err(BusError::PartialDelivery { exchange, failed }) => {
                assert_eq!(exchange, "user.events.exchange");
                assert_eq!(failed, vec!["a.user.queue".to_string()]);
            }
            other => panic!("expected partial delivery, got {:?}", other),
        }
        assert_eq!(bus.queue_depth("b.user.queue"), Some(1));
    }

    mod props {
        use super::super::topic_matches;
        use proptest::prelude::*;

        fn routing_key() -> impl Strategy<Value = String> {
            proptest::collection::vec("[a-z]{1,6}", 1..5).prop_map(|words| words.join("."))
        }

        proptest! {
            #[test]
            fn hash_matches_every_key(key in routing_key()) {
                prop_assert!(topic_matches("#", &key));
            }

            #[test]
            fn literal_pattern_matches_itself(key in routing_key()) {
                prop_assert!(topic_matches(&key, &key));
            }

            #[test]
            fn star_matches_one_word_only(key in routing_key()) {
                let words = key.split('.').count();
                prop_assert_eq!(topic_matches("*", &key), words == 1);
            }
        }
    }
}
