//! Logging system setup and configuration.
//!
//! Initializes the tracing subscriber with human-readable or JSON output.

use crate::config::LoggingSettings;
use starfall_server::ServerConfig;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the configured level when set. JSON
/// output is used when either the config or the `json_format` override asks
/// for it.
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(fmt::layer()
                .json()
                .with_file(false)
                .with_line_number(false)
                .with_thread_ids(true)
                .with_thread_names(true)
            )
            .try_init()?;
    } else {
        registry
            .with(fmt::layer()
                .with_ansi(true)
                .with_file(false)
                .with_line_number(false)
                .with_thread_ids(true)
                .with_thread_names(true)
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

/// The instance-specific lines of the startup banner.
pub fn banner_details(config: &ServerConfig) -> Vec<String> {
    let fabric = match &config.cluster.redis_url {
        Some(url) => format!("redis ({url})"),
        None => "single instance".to_string(),
    };
    let store = match &config.persistence.data_dir {
        Some(dir) => format!("json files in {}", dir.display()),
        None => "memory only".to_string(),
    };
    vec![
        format!("Instance: {}", config.instance_id()),
        format!("Listening: {}", config.bind_address),
        format!("Fabric: {fabric}"),
        format!("Store: {store}"),
    ]
}

/// Logs the startup banner.
pub fn display_banner(config: &ServerConfig) {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║           🌠 STARFALL SERVER 🌠          ║");
    info!("║                  v{:<23}║", version);
    info!("╚══════════════════════════════════════════╝");
    for line in banner_details(config) {
        info!("   {}", line);
    }
}
