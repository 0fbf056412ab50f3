//! Hourly consumption buckets

use crate::Result;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct HourlyBucket {
    pub device_id: Uuid,
    pub hour_start: NaiveDateTime,
    pub total: f64,
}

/// Storage for per-(device, hour) totals.
///
/// `accumulate` is an atomic read-modify-write: concurrent measurements for the same
/// bucket never lose an update.
#[async_trait::async_trait]
pub trait BucketStore: Send + Sync {
    /// Add `value` to the bucket, creating it if absent. Returns the new total.
    async fn accumulate(&self, device_id: Uuid, hour_start: NaiveDateTime, value: f64) -> Result<f64>;

    /// Buckets with `start <= hour_start <= end`, ascending by hour
    async fn range(
        &self,
        device_id: Uuid,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<HourlyBucket>>;
}

#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<(Uuid, NaiveDateTime), f64>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait::async_trait]
impl BucketStore for MemoryBucketStore {
    async fn accumulate(&self, device_id: Uuid, hour_start: NaiveDateTime, value: f64) -> Result<f64> {
        // The entry guard holds the shard lock for the whole update
        let mut entry = self.buckets.entry((device_id, hour_start)).or_insert(0.0);
        *entry += value;
        Ok(*entry)
    }

    async fn range(
        &self,
        device_id: Uuid,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<HourlyBucket>> {
        let mut buckets: Vec<HourlyBucket> = self
            .buckets
            .iter()
            .filter(|e| e.key().0 == device_id && e.key().1 >= start && e.key().1 <= end)
            .map(|e| HourlyBucket { device_id, hour_start: e.key().1, total: *e.value() })
            .collect();
        buckets.sort_by_key(|b| b.hour_start);
        Ok(buckets)
    }
}

#[derive(Debug, Clone)]
pub struct PgBucketStore {
    pool: PgPool,
}

impl PgBucketStore {
    /// Connect and run the bucket migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(database_url).await?;
        // Both crates migrate the same database; tolerate the other crate's versions
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator.run(&pool).await?;
        tracing::info!("PgBucketStore connected and migrated");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl BucketStore for PgBucketStore {
    async fn accumulate(&self, device_id: Uuid, hour_start: NaiveDateTime, value: f64) -> Result<f64> {
        let row = sqlx::query(
            "INSERT INTO hourly_energy_consumption (device_id, hour_timestamp, total_energy_consumption)
             VALUES ($1, $2, $3)
             ON CONFLICT (device_id, hour_timestamp) DO UPDATE
             SET total_energy_consumption = hourly_energy_consumption.total_energy_consumption
                 + EXCLUDED.total_energy_consumption
             RETURNING total_energy_consumption",
        )
        .bind(device_id)
        .bind(hour_start)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("total_energy_consumption"))
    }

    async fn range(
        &self,
        device_id: Uuid,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<HourlyBucket>> {
        let rows = sqlx::query(
            "SELECT hour_timestamp, total_energy_consumption FROM hourly_energy_consumption
             WHERE device_id = $1 AND hour_timestamp BETWEEN $2 AND $3
             ORDER BY hour_timestamp",
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| HourlyBucket {
                device_id,
                hour_start: row.get("hour_timestamp"),
                total: row.get("total_energy_consumption"),
            })
            .collect())
    }
}
