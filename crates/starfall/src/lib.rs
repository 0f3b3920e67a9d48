//! # Starfall Game Server - Main Entry Point
//!
//! Authoritative server for a chunked, procedurally generated space world.
//! This entry point handles CLI parsing, configuration loading, logging and
//! application lifecycle management.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! starfall
//!
//! # Specify custom configuration
//! starfall --config production.toml
//!
//! # Join a cluster and keep durable state on disk
//! starfall --instance-id eu-1 --redis-url redis://127.0.0.1/ --data-dir /var/lib/starfall
//!
//! # JSON logging for production
//! starfall --json-logs
//! ```
//!
//! ## Configuration
//!
//! The server loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//!
//! ## Signal Handling
//!
//! The server handles graceful shutdown on:
//! - SIGINT (Ctrl+C)
//! - SIGTERM (Unix systems)
//!
//! A second signal during shutdown exits immediately.

use tracing::error;

mod app;
mod cli;
mod config;
mod logging;
mod signals;

use app::Application;
use cli::CliArgs;

pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Load configuration to get logging settings
    let config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();

    // Setup logging before anything else
    let log_settings = match &args.log_level {
        Some(level) => LoggingSettings {
            level: level.clone(),
            ..config.logging.clone()
        },
        None => config.logging.clone(),
    };
    if let Err(e) = logging::setup_logging(&log_settings, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e}");
            std::process::exit(1);
        }
    }

    Ok(())
}

// Re-export main types for potential library usage
pub use config::{
    AppConfig, ClusterSettings, ConfigError, LoggingSettings,
    PersistenceSettings, RateLimitSettings, ServerSettings, WorldSettings,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let server_config = config
            .to_server_config()
            .expect("Default config should convert to ServerConfig");
        assert_eq!(server_config.max_connections, 1000);
        assert_eq!(server_config.cluster.coordinator.capacity, 1000);
    }

    #[tokio::test]
    async fn test_config_validation() {
        let mut config = AppConfig::default();

        config.server.bind_address = "invalid".to_string();
        assert!(config.validate().is_err());

        config.server.bind_address = "127.0.0.1:8080".to_string();
        config.world.chunk_size = 0.0;
        assert!(config.validate().is_err());

        config.world.chunk_size = 1000.0;
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }
}
