//! Error types for the replica balancer

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BalancerError>;

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error(transparent)]
    Upstream(#[from] reqwest::Error),

    #[error(transparent)]
    InvalidResponse(#[from] http::Error),

    #[error(transparent)]
    Bus(#[from] fleet_bus::BusError),

    #[error("Invalid balancer configuration: {message}")]
    InvalidConfig { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_error_message_appears_once() {
        let err: BalancerError = fleet_bus::BusError::UnknownQueue("ingest.queue.4".to_string()).into();
        let rendered = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(rendered.matches("ingest.queue.4").count(), 1);
    }
}
