//! Signal handling for graceful server shutdown.
//!
//! The first SIGINT/SIGTERM (Ctrl+C on Windows) starts a graceful shutdown;
//! [`force_exit_on_second_signal`] turns the next one into an immediate exit.

use starfall_core::ShutdownState;
use tokio::signal;
use tracing::{error, info, warn};

/// Waits for a termination signal and initiates shutdown on `shutdown_state`.
pub async fn setup_signal_handlers(shutdown_state: &ShutdownState) -> Result<(), Box<dyn std::error::Error>> {
    wait_for_signal().await?;
    info!("📡 Received shutdown signal - initiating graceful shutdown");
    shutdown_state.initiate_shutdown();
    Ok(())
}

/// Exits the process with code 1 when another signal arrives.
pub fn force_exit_on_second_signal() {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!("Failed to set up forced shutdown signal handler: {e}");
            return;
        }

        warn!("Shutdown signal received again! Exiting immediately.");
        std::process::exit(1);
    });
}

async fn wait_for_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => ()
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    Ok(())
}
