//! Incremental hourly aggregation of device measurements

use crate::bucket::BucketStore;
use crate::messages::{DailyConsumption, HourlyConsumption, OverconsumptionAlert, RealtimeConsumption};
use crate::metrics::MonitorMetrics;
use crate::notifier::ThresholdNotifier;
use crate::realtime::{consumption_topic, RealtimeHub};
use crate::Result;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::sync::Arc;
use uuid::Uuid;

/// Result of folding one measurement into its bucket
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub hour_start: NaiveDateTime,
    pub hourly_total: f64,
    pub alert: Option<OverconsumptionAlert>,
}

/// Start of the hour containing `timestamp`
pub fn truncate_to_hour(timestamp: NaiveDateTime) -> NaiveDateTime {
    timestamp
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(timestamp)
}

pub struct HourlyAggregator {
    buckets: Arc<dyn BucketStore>,
    hub: Arc<RealtimeHub>,
    notifier: Arc<ThresholdNotifier>,
    metrics: Arc<MonitorMetrics>,
}

impl HourlyAggregator {
    pub fn new(
        buckets: Arc<dyn BucketStore>,
        hub: Arc<RealtimeHub>,
        notifier: Arc<ThresholdNotifier>,
        metrics: Arc<MonitorMetrics>,
    ) -> Self {
        Self { buckets, hub, notifier, metrics }
    }

    /// Add a measurement to its hourly bucket, push the live update and check the
    /// threshold against the new total.
    ///
    /// Measurements carry no dedup key, so a redelivered measurement is counted twice.
    pub async fn record_measurement(
        &self,
        device_id: Uuid,
        timestamp: NaiveDateTime,
        value: f64,
    ) -> Result<RecordOutcome> {
        let hour_start = truncate_to_hour(timestamp);
        let hourly_total = self.buckets.accumulate(device_id, hour_start, value).await?;
        self.metrics.measurements_processed.inc();
        tracing::debug!(
            "Updated hourly energy consumption for device {} at hour {}: {}",
            device_id,
            hour_start,
            hourly_total
        );

        let update = RealtimeConsumption {
            device_id,
            timestamp,
            consumption: value,
            hour_timestamp: hour_start,
            hourly_total,
        };
        if self.hub.push(&consumption_topic(device_id), &update) > 0 {
            self.metrics.realtime_pushes.inc();
        }

        let alert = self.notifier.check_threshold(device_id, hourly_total, timestamp).await;
        Ok(RecordOutcome { hour_start, hourly_total, alert })
    }

    /// Hourly buckets of `date` (00:00:00 through 23:59:59) with their sum
    pub async fn daily_consumption(&self, device_id: Uuid, date: NaiveDate) -> Result<DailyConsumption> {
        let start = date.and_time(NaiveTime::MIN);
        let end = date.and_hms_opt(23, 59, 59).unwrap_or(start);

        let mut hourly: Vec<HourlyConsumption> = self
            .buckets
            .range(device_id, start, end)
            .await?
            .into_iter()
            .map(|b| HourlyConsumption { hour_timestamp: b.hour_start, consumption: b.total })
            .collect();
        hourly.sort_by_key(|h| h.hour_timestamp);

        let total_consumption = hourly.iter().map(|h| h.consumption).sum();
        Ok(DailyConsumption { device_id, date, total_consumption, hourly_consumptions: hourly })
    }
}
