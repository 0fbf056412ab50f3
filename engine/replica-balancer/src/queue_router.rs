//! Routes measurements from the central queue to replica-private ingest queues.
//!
//! The router never decodes a measurement: the delivery (body and headers) is
//! re-sent as-is to `ingest.queue.{n}`, where `n` is the selected replica's 1-based
//! ordinal.

use crate::discovery::ReplicaDiscovery;
use crate::metrics::BalancerMetrics;
use crate::selector::WeightedSelector;
use crate::Result;
use fleet_bus::topology::{ingest_queue, DEVICE_MEASUREMENT_QUEUE};
use fleet_bus::{Delivery, EventBus, MessageHandler, SubscriptionHandle};
use std::sync::Arc;

pub struct QueueRouter {
    bus: Arc<dyn EventBus>,
    discovery: Arc<dyn ReplicaDiscovery>,
    selector: Arc<WeightedSelector>,
    metrics: Arc<BalancerMetrics>,
}

impl QueueRouter {
    pub fn new(
        bus: Arc<dyn EventBus>,
        discovery: Arc<dyn ReplicaDiscovery>,
        selector: Arc<WeightedSelector>,
        metrics: Arc<BalancerMetrics>,
    ) -> Self {
        Self { bus, discovery, selector, metrics }
    }

    /// Route one delivery. Returns the target queue, or `None` when it was dropped.
    pub async fn route(&self, delivery: Delivery) -> Result<Option<String>> {
        let replicas = self.discovery.discover().await;
        let Some(index) = self.selector.select(replicas.len()) else {
            self.metrics.messages_dropped.inc();
            tracing::warn!(
                "QueueRouter found no replicas, dropping {} byte measurement",
                delivery.body_len()
            );
            return Ok(None);
        };

        let queue = ingest_queue(index + 1);
        self.bus.send_to_queue(&queue, delivery).await?;
        self.metrics.record_routed(&queue);
        tracing::debug!("QueueRouter routed measurement to {}", queue);
        Ok(Some(queue))
    }

    /// Start draining the central measurement queue
    pub async fn start(self: Arc<Self>) -> Result<SubscriptionHandle> {
        let bus = self.bus.clone();
        let handle = bus.subscribe(DEVICE_MEASUREMENT_QUEUE, self).await?;
        tracing::info!("QueueRouter consuming {}", DEVICE_MEASUREMENT_QUEUE);
        Ok(handle)
    }
}

#[async_trait::async_trait]
impl MessageHandler for QueueRouter {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        self.route(delivery).await?;
        Ok(())
    }
}
