//! EnergyMonitor - per-replica measurement processing
//!
//! Each monitoring replica consumes its own ingest queue, folds measurements into
//! hourly buckets ([`aggregator`]), alerts when a device's hourly total crosses the
//! threshold ([`notifier`]), and fans updates out to real-time topics ([`realtime`],
//! [`relay`]). Daily reports are served over REST ([`rest_api`]).

pub mod aggregator;
pub mod bucket;
pub mod config;
pub mod error;
pub mod listener;
pub mod messages;
pub mod metrics;
pub mod notifier;
pub mod realtime;
pub mod relay;
pub mod rest_api;

pub use aggregator::{truncate_to_hour, HourlyAggregator, RecordOutcome};
pub use bucket::{BucketStore, HourlyBucket, MemoryBucketStore, PgBucketStore};
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use listener::MeasurementListener;
pub use messages::{
    ChatEvent, DailyConsumption, HourlyConsumption, MeasurementMessage, OverconsumptionAlert,
    RealtimeConsumption,
};
pub use metrics::MonitorMetrics;
pub use notifier::ThresholdNotifier;
pub use realtime::RealtimeHub;
pub use relay::{ChatRelay, NotificationRelay};
