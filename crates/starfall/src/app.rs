//! Main application logic and lifecycle management.
//!
//! [`Application`] loads and validates the configuration, builds the game
//! server and supervises it until a shutdown signal arrives.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    signals::{force_exit_on_second_signal, setup_signal_handlers},
};
use starfall_core::ShutdownState;
use starfall_server::GameServer;
use std::time::Duration;
use tracing::{error, info, warn};

/// Upper bound on the graceful phase: final flush plus cluster deregistration.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Application {
    config: AppConfig,
    server: GameServer,
}

impl Application {
    /// Creates a new application instance.
    ///
    /// # Process
    ///
    /// 1. Load configuration from file (creating default if missing)
    /// 2. Apply command-line argument overrides
    /// 3. Validate merged configuration
    /// 4. Display startup banner
    /// 5. Build the game server (store, fabric, cluster services)
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        apply_overrides(&mut config, args);

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        } else {
            info!("✅ Configuration loaded and validated successfully");
        }

        let server_config = config.to_server_config()?;
        display_banner(&server_config);

        let server = GameServer::new(server_config).await?;

        Ok(Self { config, server })
    }

    /// Runs the server until a shutdown signal, then waits for its graceful
    /// shutdown to finish.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting Starfall Game Server Application");
        self.log_configuration_summary();

        let shutdown_state = ShutdownState::new();
        let bind_address = self.config.server.bind_address.clone();
        let mut server_handle = {
            let server = self.server;
            let shutdown_state = shutdown_state.clone();
            tokio::spawn(async move { server.start_with_shutdown_state(shutdown_state).await })
        };

        info!("✅ Starfall Server is now running!");
        info!("🎮 Ready to accept connections on {}", bind_address);
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        tokio::select! {
            signal = setup_signal_handlers(&shutdown_state) => signal?,
            finished = &mut server_handle => {
                // the server only returns on its own when it failed to start
                return match finished {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("Server error: {e}").into()),
                    Err(e) => Err(format!("Server task failed: {e}").into()),
                };
            }
        }

        force_exit_on_second_signal();

        info!("🛑 Shutdown signal received, beginning graceful shutdown...");
        info!("⏳ Flushing player state and leaving the cluster...");
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, server_handle).await {
            Ok(Ok(Ok(()))) => info!("✅ Server task completed gracefully"),
            Ok(Ok(Err(e))) => error!("❌ Server error during shutdown: {}", e),
            Ok(Err(e)) => error!("❌ Server task failed: {}", e),
            Err(_) => warn!(
                "⏰ Server did not finish within {:?}, some state may not have been flushed",
                SHUTDOWN_TIMEOUT
            ),
        }

        info!("✅ Starfall Game Server shutdown complete");
        Ok(())
    }

    /// Logs the configuration summary at startup.
    fn log_configuration_summary(&self) {
        let config = &self.config;
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", config.server.bind_address);
        info!("  👥 Max connections: {}", config.server.max_connections);
        info!(
            "  🌍 World: {} chunks of {:.0} units from the origin",
            config.world.world_radius_chunks, config.world.chunk_size
        );
        info!(
            "  💾 Storage: {}",
            config.persistence.data_dir.as_deref().unwrap_or("in-memory")
        );
        info!(
            "  🛰️ Cluster: {} (capacity {})",
            config.cluster.redis_url.as_deref().unwrap_or("single instance"),
            config.cluster.capacity
        );
    }
}

fn apply_overrides(config: &mut AppConfig, args: CliArgs) {
    if let Some(bind_address) = args.bind_address {
        config.server.bind_address = bind_address;
    }

    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }

    if args.json_logs {
        config.logging.json_format = true;
    }

    if let Some(instance_id) = args.instance_id {
        config.cluster.instance_id = Some(instance_id);
    }

    if let Some(redis_url) = args.redis_url {
        config.cluster.redis_url = Some(redis_url);
    }

    if let Some(data_dir) = args.data_dir {
        config.persistence.data_dir = Some(data_dir.to_string_lossy().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn cli_overrides_win_over_the_file() {
        let mut config = AppConfig::default();
        let args = CliArgs {
            config_path: PathBuf::from("config.toml"),
            bind_address: Some("0.0.0.0:9000".to_string()),
            log_level: Some("debug".to_string()),
            json_logs: true,
            instance_id: Some("eu-1".to_string()),
            redis_url: Some("redis://cache/".to_string()),
            data_dir: Some(PathBuf::from("/srv/starfall")),
        };

        apply_overrides(&mut config, args);

        assert_eq!(config.server.bind_address, "0.0.0.0:9000");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert_eq!(config.cluster.instance_id.as_deref(), Some("eu-1"));
        assert_eq!(config.cluster.redis_url.as_deref(), Some("redis://cache/"));
        assert_eq!(config.persistence.data_dir.as_deref(), Some("/srv/starfall"));
    }

    #[test]
    fn absent_overrides_keep_the_file_values() {
        let mut config = AppConfig::default();
        config.cluster.instance_id = Some("from-file".to_string());
        apply_overrides(&mut config, CliArgs::default());

        assert_eq!(config.server.bind_address, "127.0.0.1:8080");
        assert_eq!(config.cluster.instance_id.as_deref(), Some("from-file"));
        assert!(!config.logging.json_format);
    }

    #[tokio::test]
    async fn test_application_creation() {
        let dir = TempDir::new().unwrap();
        let args = CliArgs {
            config_path: dir.path().join("config.toml"),
            instance_id: Some("test-instance".to_string()),
            data_dir: Some(dir.path().join("data")),
            ..CliArgs::default()
        };

        let app = Application::new(args).await.unwrap();
        assert!(dir.path().join("config.toml").exists());
        assert_eq!(app.server.config().instance_id(), "test-instance");
        assert_eq!(app.config.persistence.data_dir.as_deref(), dir.path().join("data").to_str());
    }

    #[tokio::test]
    async fn invalid_override_fails_validation() {
        let dir = TempDir::new().unwrap();
        let args = CliArgs {
            config_path: dir.path().join("config.toml"),
            log_level: Some("loud".to_string()),
            ..CliArgs::default()
        };

        let result = Application::new(args).await;
        let message = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("Configuration validation failed"));
    }
}
