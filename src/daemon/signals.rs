//! Signal handling for graceful shutdown
//!
//! Asynchronous handling of SIGTERM and SIGINT so in-flight dispatches can
//! finish before the listener closes.

use tokio::sync::broadcast;
use tracing::{error, info};

/// Setup signal handlers for graceful shutdown.
///
/// Returns a broadcast pair; the server side subscribes and starts draining
/// when a signal arrives.
#[cfg(unix)]
pub fn setup_signal_handlers() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let shutdown_tx_clone = shutdown_tx.clone();

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
        }

        if let Err(e) = shutdown_tx_clone.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    (shutdown_tx, shutdown_rx)
}

/// Non-Unix platforms only get Ctrl+C.
#[cfg(not(unix))]
pub fn setup_signal_handlers() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
    use tokio::signal;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let shutdown_tx_clone = shutdown_tx.clone();

    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }

        info!("Received Ctrl+C, initiating graceful shutdown");

        if let Err(e) = shutdown_tx_clone.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    (shutdown_tx, shutdown_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_handler_creation() {
        let (_tx, _rx) = setup_signal_handlers();
    }
}
