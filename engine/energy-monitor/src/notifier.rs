//! Threshold alerting on hourly totals

use crate::messages::OverconsumptionAlert;
use crate::metrics::MonitorMetrics;
use crate::realtime::{device_notification_topic, RealtimeHub};
use chrono::NaiveDateTime;
use fact_replication::{DeviceRecord, ReplicaStore};
use fleet_bus::topology::{OVERCONSUMPTION_EXCHANGE, OVERCONSUMPTION_KEY};
use fleet_bus::{publish_json, EventBus};
use std::sync::Arc;
use uuid::Uuid;

pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Fires an alert every time a running total is strictly above the threshold.
///
/// There is no suppression window: each measurement that leaves the hour above the
/// threshold produces another alert.
pub struct ThresholdNotifier {
    threshold: f64,
    devices: Arc<dyn ReplicaStore<DeviceRecord>>,
    bus: Arc<dyn EventBus>,
    hub: Arc<RealtimeHub>,
    metrics: Arc<MonitorMetrics>,
}

impl ThresholdNotifier {
    pub fn new(
        threshold: f64,
        devices: Arc<dyn ReplicaStore<DeviceRecord>>,
        bus: Arc<dyn EventBus>,
        hub: Arc<RealtimeHub>,
        metrics: Arc<MonitorMetrics>,
    ) -> Self {
        Self { threshold, devices, bus, hub, metrics }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn check_threshold(
        &self,
        device_id: Uuid,
        running_total: f64,
        timestamp: NaiveDateTime,
    ) -> Option<OverconsumptionAlert> {
        if running_total <= self.threshold {
            return None;
        }
        tracing::warn!(
            "Device {} exceeded consumption threshold: {} > {}",
            device_id,
            running_total,
            self.threshold
        );

        let alert = OverconsumptionAlert {
            device_id,
            user_id: None,
            device_name: self.device_name(device_id).await,
            current_consumption: running_total,
            threshold: self.threshold,
            timestamp,
        };
        self.metrics.alerts_fired.inc();

        if let Err(e) = publish_json(self.bus.as_ref(), OVERCONSUMPTION_EXCHANGE, OVERCONSUMPTION_KEY, &alert).await {
            self.metrics.alert_publish_failures.inc();
            tracing::error!("Failed to publish overconsumption alert for device {}: {}", device_id, e);
        }
        self.hub.push(&device_notification_topic(device_id), &alert);

        tracing::info!("Published overconsumption notification for device {}", device_id);
        Some(alert)
    }

    async fn device_name(&self, device_id: Uuid) -> String {
        match self.devices.get(device_id).await {
            Ok(Some(DeviceRecord { name: Some(name), .. })) => name,
            Ok(_) => UNKNOWN_DEVICE_NAME.to_string(),
            Err(e) => {
                tracing::warn!("Device lookup for {} failed: {}", device_id, e);
                UNKNOWN_DEVICE_NAME.to_string()
            }
        }
    }
}
