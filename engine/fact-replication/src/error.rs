//! Error types for fact replication

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Bus(#[from] fleet_bus::BusError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("Peer rejected {url}: {status}")]
    PeerRejected { url: String, status: u16 },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid replication configuration: {message}")]
    InvalidConfig { message: String },
}
