//! Energy Fleet Service Library
//!
//! Configuration loading, logging setup, component wiring per role and graceful
//! shutdown for the `energy-fleet` binary.

use anyhow::{Context, Result};
use std::path::Path;

pub mod config;
pub mod logging;
pub mod service;
pub mod signals;

pub use config::ServiceConfig;
pub use logging::initialize_logging_with_config;
pub use service::{ServiceHealth, ServiceRole, ServiceState};
pub use signals::{graceful_shutdown, setup_signal_handlers};

/// Load configuration from files and environment variables
pub fn load_configuration(path: Option<&Path>) -> Result<ServiceConfig> {
    config::load_config(path).context("Failed to load service configuration")
}
