//! Storage for replicated facts and the locally owned rows that depend on them

use crate::messages::{DeviceRecord, Record, UserDeviceLink, UserRecord};
use crate::Result;
use dashmap::{DashMap, DashSet};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Replicated copies of facts owned by another service
#[async_trait::async_trait]
pub trait ReplicaStore<R: Record>: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<R>>;

    /// Id of the record currently holding a unique secondary key, if any
    async fn find_by_unique_key(&self, key: &str) -> Result<Option<Uuid>>;

    async fn insert(&self, record: R) -> Result<()>;

    /// Overwrite mutable fields. Returns `false` when the id is absent.
    async fn update(&self, record: R) -> Result<bool>;

    /// Returns `false` when the id is absent
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// User-device associations owned by the local service
#[async_trait::async_trait]
pub trait LinkStore: Send + Sync {
    /// Returns `false` when the link already existed
    async fn insert_link(&self, link: UserDeviceLink) -> Result<bool>;
    async fn links_for_user(&self, user_id: Uuid) -> Result<Vec<UserDeviceLink>>;
    async fn links_for_device(&self, device_id: Uuid) -> Result<Vec<UserDeviceLink>>;
    async fn delete_link(&self, link: UserDeviceLink) -> Result<bool>;
}

/// In-memory replica store
pub struct MemoryReplicaStore<R> {
    records: DashMap<Uuid, R>,
}

impl<R: Record> MemoryReplicaStore<R> {
    pub fn new() -> Self {
        Self { records: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<R: Record> Default for MemoryReplicaStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<R: Record> ReplicaStore<R> for MemoryReplicaStore<R> {
    async fn get(&self, id: Uuid) -> Result<Option<R>> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn find_by_unique_key(&self, key: &str) -> Result<Option<Uuid>> {
        Ok(self
            .records
            .iter()
            .find(|entry| entry.value().unique_key() == Some(key))
            .map(|entry| *entry.key()))
    }

    async fn insert(&self, record: R) -> Result<()> {
        self.records.entry(record.id()).or_insert(record);
        Ok(())
    }

    async fn update(&self, record: R) -> Result<bool> {
        match self.records.get_mut(&record.id()) {
            Some(mut existing) => {
                *existing = record;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.records.remove(&id).is_some())
    }
}

/// In-memory link store
#[derive(Default)]
pub struct MemoryLinkStore {
    links: DashSet<UserDeviceLink>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[async_trait::async_trait]
impl LinkStore for MemoryLinkStore {
    async fn insert_link(&self, link: UserDeviceLink) -> Result<bool> {
        Ok(self.links.insert(link))
    }

    async fn links_for_user(&self, user_id: Uuid) -> Result<Vec<UserDeviceLink>> {
        Ok(self.links.iter().filter(|l| l.user_id == user_id).map(|l| *l).collect())
    }

    async fn links_for_device(&self, device_id: Uuid) -> Result<Vec<UserDeviceLink>> {
        Ok(self.links.iter().filter(|l| l.device_id == device_id).map(|l| *l).collect())
    }

    async fn delete_link(&self, link: UserDeviceLink) -> Result<bool> {
        Ok(self.links.remove(&link).is_some())
    }
}

/// Postgres-backed replica and link storage
#[derive(Debug, Clone)]
pub struct PgFactStore {
    pool: PgPool,
}

impl PgFactStore {
    /// Connect and run the replica migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(database_url).await?;
        // Both crates migrate the same database; tolerate the other crate's versions
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator.run(&pool).await?;
        tracing::info!("PgFactStore connected and migrated");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl ReplicaStore<UserRecord> for PgFactStore {
    async fn get(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT id, email, full_name FROM replica_users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| UserRecord {
            id: row.get("id"),
            email: row.get("email"),
            full_name: row.get("full_name"),
        }))
    }

    async fn find_by_unique_key(&self, key: &str) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT id FROM replica_users WHERE email = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("id")))
    }

    async fn insert(&self, record: UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO replica_users (id, email, full_name) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(record.id)
        .bind(record.email)
        .bind(record.full_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, record: UserRecord) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE replica_users SET email = $2, full_name = $3, replicated_at = NOW() WHERE id = $1",
        )
        .bind(record.id)
        .bind(record.email)
        .bind(record.full_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM replica_users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl ReplicaStore<DeviceRecord> for PgFactStore {
    async fn get(&self, id: Uuid) -> Result<Option<DeviceRecord>> {
        let row = sqlx::query("SELECT id, name, device_type FROM replica_devices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| DeviceRecord {
            id: row.get("id"),
            name: row.get("name"),
            device_type: row.get("device_type"),
        }))
    }

    async fn find_by_unique_key(&self, _key: &str) -> Result<Option<Uuid>> {
        Ok(None)
    }

    async fn insert(&self, record: DeviceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO replica_devices (id, name, device_type) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(record.id)
        .bind(record.name)
        .bind(record.device_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, record: DeviceRecord) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE replica_devices SET name = $2, device_type = $3, replicated_at = NOW() WHERE id = $1",
        )
        .bind(record.id)
        .bind(record.name)
        .bind(record.device_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM replica_devices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl LinkStore for PgFactStore {
    async fn insert_link(&self, link: UserDeviceLink) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO user_device_links (user_id, device_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(link.user_id)
        .bind(link.device_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn links_for_user(&self, user_id: Uuid) -> Result<Vec<UserDeviceLink>> {
        let rows = sqlx::query("SELECT user_id, device_id FROM user_device_links WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| UserDeviceLink { user_id: row.get("user_id"), device_id: row.get("device_id") })
            .collect())
    }

    async fn links_for_device(&self, device_id: Uuid) -> Result<Vec<UserDeviceLink>> {
        let rows = sqlx::query("SELECT user_id, device_id FROM user_device_links WHERE device_id = $1")
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| UserDeviceLink { user_id: row.get("user_id"), device_id: row.get("device_id") })
            .collect())
    }

    async fn delete_link(&self, link: UserDeviceLink) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_device_links WHERE user_id = $1 AND device_id = $2")
            .bind(link.user_id)
            .bind(link.device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
