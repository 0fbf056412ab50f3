//! Measurements published to the central exchange reach replica ingest queues unchanged

use fleet_bus::topology::{
    declare_fleet_topology, declare_ingest_queues, ingest_queue, DEVICE_MEASUREMENTS_EXCHANGE,
    DEVICE_MEASUREMENT_KEY,
};
use fleet_bus::{Delivery, EventBus, InMemoryBus, MessageHandler};
use parking_lot::Mutex;
use replica_balancer::{BalancerMetrics, QueueRouter, StaticDiscovery, WeightedSelector, DEFAULT_WEIGHTS};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Capture {
    seen: Mutex<Vec<Delivery>>,
}

#[async_trait::async_trait]
impl MessageHandler for Capture {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        self.seen.lock().push(delivery);
        Ok(())
    }
}

#[tokio::test]
async fn test_router_preserves_measurement_bytes() {
    let bus = Arc::new(InMemoryBus::new());
    declare_fleet_topology(bus.as_ref()).await.unwrap();
    declare_ingest_queues(bus.as_ref(), DEFAULT_WEIGHTS.len()).await.unwrap();

    let router = Arc::new(QueueRouter::new(
        bus.clone() as Arc<dyn EventBus>,
        Arc::new(StaticDiscovery::new(vec!["10.0.0.1".to_string()])),
        Arc::new(WeightedSelector::new(DEFAULT_WEIGHTS.to_vec())),
        Arc::new(BalancerMetrics::new()),
    ));
    let _router = router.start().await.unwrap();

    let capture = Arc::new(Capture::default());
    let _consumer = bus.subscribe(&ingest_queue(1), capture.clone()).await.unwrap();

    let body = br#"{"timestamp":"2024-01-15T10:05:00","deviceId":"3f2a","measurementValue":0.25}"#.to_vec();
    bus.publish(DEVICE_MEASUREMENTS_EXCHANGE, DEVICE_MEASUREMENT_KEY, body.clone()).await.unwrap();

    for _ in 0..100 {
        if !capture.seen.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let seen = capture.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].body, body);
    assert_eq!(seen[0].routing_key, DEVICE_MEASUREMENT_KEY);
}
