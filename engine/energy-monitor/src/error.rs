//! Error types for the energy monitor

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Bus(#[from] fleet_bus::BusError),

    #[error(transparent)]
    Replica(#[from] fact_replication::ReplicationError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid monitor configuration: {message}")]
    InvalidConfig { message: String },
}
