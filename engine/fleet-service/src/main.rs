//! Energy Fleet Service
//!
//! Runs the load balancer, a monitoring replica, the real-time relay, or all of
//! them in one process, and shuts them down gracefully on Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use fleet_service::{
    graceful_shutdown, initialize_logging_with_config, load_configuration, setup_signal_handlers,
    ServiceRole, ServiceState,
};

#[derive(Debug, Parser)]
#[command(name = "energy-fleet", version, about = "Energy fleet monitoring services")]
struct Cli {
    /// Components to run in this process
    #[arg(long, value_enum, default_value_t = ServiceRole::All)]
    role: ServiceRole,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(cli.config.as_deref()).context("Failed to load configuration")?;
    initialize_logging_with_config(&config.logging.level, &config.logging.format)?;

    info!("Starting Energy Fleet Service v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded successfully");

    // Create service state
    let service_state = Arc::new(ServiceState::new(config, cli.role).await?);
    info!("Service state initialized");

    // Setup signal handlers for graceful shutdown
    let shutdown_signal = setup_signal_handlers()?;
    info!("Signal handlers configured");

    service_state.start_consumers().await?;
    let (bound, mut tasks) = service_state.start_http_servers().await?;
    if let Some(addr) = bound.balancer {
        info!("Load balancer ready on {}", addr);
    }
    if let Some(addr) = bound.monitor {
        info!("Monitoring REST API ready on {}", addr);
    }

    let reporter = {
        let state = service_state.clone();
        tokio::spawn(async move { state.run_metrics_reporter().await })
    };
    tasks.push(reporter);

    let housekeeping = {
        let state = service_state.clone();
        tokio::spawn(async move { state.run_housekeeping().await })
    };
    tasks.push(housekeeping);

    // Wait for shutdown signal
    info!("Energy Fleet Service is running as {:?}. Press Ctrl+C to shutdown gracefully.", cli.role);
    let _ = shutdown_signal.await;

    info!("Shutdown signal received. Initiating graceful shutdown...");
    graceful_shutdown(service_state, tasks).await?;

    info!("Energy Fleet Service shutdown complete");
    Ok(())
}
