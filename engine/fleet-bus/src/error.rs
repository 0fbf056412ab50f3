//! Error types for the event bus

use thiserror::Error;

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur while declaring topology or moving messages
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Exchange not declared: {0}")]
    UnknownExchange(String),

    #[error("Queue not declared: {0}")]
    UnknownQueue(String),

    #[error("Exchange {name} already declared with a different kind")]
    ExchangeKindMismatch { name: String },

    #[error("Queue {0} already has an active consumer")]
    QueueAlreadyConsumed(String),

    #[error("Queue {0} is closed")]
    QueueClosed(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error("Message on {exchange} not delivered to: {}", .failed.join(", "))]
    PartialDelivery { exchange: String, failed: Vec<String> },
}
