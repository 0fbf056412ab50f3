//! RedisBus against a live server. Set FLEET_TEST_REDIS_URL to run.

use fleet_bus::topology::{self, declare_fleet_topology, declare_service_queues};
use fleet_bus::{BusError, Delivery, EventBus, MessageHandler, RedisBus};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

struct Collector {
    seen: Mutex<Vec<Delivery>>,
}

#[async_trait::async_trait]
impl MessageHandler for Collector {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        self.seen.lock().await.push(delivery);
        Ok(())
    }
}

fn redis_url() -> Option<String> {
    std::env::var("FLEET_TEST_REDIS_URL").ok()
}

fn unique_prefix() -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    format!("fleet-test-{}-{}", std::process::id(), nanos)
}

#[tokio::test]
async fn test_two_connections_share_one_topology() {
    let Some(url) = redis_url() else {
        eprintln!("FLEET_TEST_REDIS_URL not set, skipping");
        return;
    };
    let prefix = unique_prefix();

    // One connection plays the publishing service, the other the consuming one
    let publisher = RedisBus::connect_with_prefix(&url, &prefix).await.unwrap();
    let consumer = RedisBus::connect_with_prefix(&url, &prefix).await.unwrap();
    declare_fleet_topology(&publisher).await.unwrap();
    declare_service_queues(&consumer, "monitoring").await.unwrap();

    publisher
        .publish(topology::DEVICE_EVENTS_EXCHANGE, topology::DEVICE_CREATE_KEY, b"{\"a\":1}".to_vec())
        .await
        .unwrap();
    assert_eq!(consumer.queue_depth("monitoring.device.queue").await.unwrap(), 1);

    let collector = Arc::new(Collector { seen: Mutex::new(Vec::new()) });
    let handle = consumer.subscribe("monitoring.device.queue", collector.clone()).await.unwrap();
    for _ in 0..50 {
        if !collector.seen.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.abort();

    let seen = collector.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].routing_key, topology::DEVICE_CREATE_KEY);
    assert_eq!(seen[0].body, b"{\"a\":1}".to_vec());
}

#[tokio::test]
async fn test_redeclaring_with_other_kind_is_rejected() {
    let Some(url) = redis_url() else {
        eprintln!("FLEET_TEST_REDIS_URL not set, skipping");
        return;
    };
    let bus = RedisBus::connect_with_prefix(&url, &unique_prefix()).await.unwrap();

    bus.declare_exchange("x", fleet_bus::ExchangeKind::Topic).await.unwrap();
    bus.declare_exchange("x", fleet_bus::ExchangeKind::Topic).await.unwrap();
    let result = bus.declare_exchange("x", fleet_bus::ExchangeKind::Fanout).await;

    assert!(matches!(result, Err(BusError::ExchangeKindMismatch { .. })));
}
