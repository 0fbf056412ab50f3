//! Signal handling for graceful shutdown

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::service::ServiceState;

/// Setup signal handlers for graceful shutdown.
///
/// The receiver completes on Ctrl+C or, on Unix, SIGTERM, whichever comes first.
pub fn setup_signal_handlers() -> Result<oneshot::Receiver<()>> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    #[cfg(unix)]
    let sigterm = {
        use signal_hook::consts::SIGTERM;
        use std::sync::atomic::AtomicBool;

        let flag = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, flag.clone())?;
        flag
    };

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminated = async {
            use std::sync::atomic::Ordering;
            while !sigterm.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Ctrl+C signal received"),
                Err(e) => {
                    error!("Failed to listen for Ctrl+C signal: {}", e);
                    return;
                }
            },
            _ = terminated => info!("SIGTERM signal received"),
        }

        let _ = shutdown_tx.send(());
    });

    Ok(shutdown_rx)
}

/// Stop the service and wait for its tasks, each bounded by the shutdown timeout
pub async fn graceful_shutdown(service_state: Arc<ServiceState>, tasks: Vec<JoinHandle<()>>) -> Result<()> {
    info!("Starting graceful shutdown...");

    if let Err(e) = service_state.shutdown().await {
        error!("Failed to shutdown service components: {}", e);
    }

    let shutdown_timeout = Duration::from_secs(service_state.config.service.shutdown_timeout_secs);
    match timeout(shutdown_timeout, futures::future::join_all(tasks)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!("Service task failed: {}", e);
                }
            }
            info!("All service tasks stopped gracefully");
        }
        Err(_) => {
            warn!("Service tasks did not stop within {:?}, forcing shutdown", shutdown_timeout);
        }
    }

    info!("Graceful shutdown complete");
    Ok(())
}
