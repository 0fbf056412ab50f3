//! Consumes this replica's ingest queue

use crate::aggregator::HourlyAggregator;
use crate::messages::MeasurementMessage;
use crate::metrics::MonitorMetrics;
use crate::Result;
use anyhow::Context;
use fact_replication::{DeviceRecord, ReplicaStore};
use fleet_bus::topology::ingest_queue;
use fleet_bus::{Delivery, EventBus, MessageHandler, SubscriptionHandle};
use std::sync::Arc;

pub struct MeasurementListener {
    aggregator: Arc<HourlyAggregator>,
    devices: Arc<dyn ReplicaStore<DeviceRecord>>,
    metrics: Arc<MonitorMetrics>,
}

impl MeasurementListener {
    pub fn new(
        aggregator: Arc<HourlyAggregator>,
        devices: Arc<dyn ReplicaStore<DeviceRecord>>,
        metrics: Arc<MonitorMetrics>,
    ) -> Self {
        Self { aggregator, devices, metrics }
    }

    /// Process one measurement. Returns `false` when it was skipped.
    pub async fn on_measurement(&self, message: MeasurementMessage) -> Result<bool> {
        if self.devices.get(message.device_id).await?.is_none() {
            self.metrics.measurements_unknown_device.inc();
            tracing::warn!("Received measurement for unknown device {}, skipping", message.device_id);
            return Ok(false);
        }

        tracing::info!(
            "Received device measurement: device={}, timestamp={}, value={}",
            message.device_id,
            message.timestamp,
            message.measurement_value
        );
        self.aggregator
            .record_measurement(message.device_id, message.timestamp, message.measurement_value)
            .await?;
        Ok(true)
    }

    /// Consume `ingest.queue.{replica_id}`
    pub async fn start(self: Arc<Self>, bus: &dyn EventBus, replica_id: usize) -> Result<SubscriptionHandle> {
        let queue = ingest_queue(replica_id);
        let handle = bus.subscribe(&queue, self).await?;
        tracing::info!("MeasurementListener consuming {}", queue);
        Ok(handle)
    }
}

#[async_trait::async_trait]
impl MessageHandler for MeasurementListener {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        let message: MeasurementMessage = delivery.decode().context("undecodable measurement")?;
        self.on_measurement(message).await?;
        Ok(())
    }
}
