//! Command-line interface handling for the Starfall server.
//!
//! Every option here overrides the matching entry of the configuration file.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for bind address
    pub bind_address: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Optional override for this instance's cluster identity
    pub instance_id: Option<String>,
    /// Optional Redis URL for the shared state fabric
    pub redis_url: Option<String>,
    /// Optional directory for the JSON file store
    pub data_dir: Option<PathBuf>,
}

impl CliArgs {
    /// Parses the process arguments.
    ///
    /// # Panics
    ///
    /// Exits the process on invalid arguments, as clap does. The config path
    /// always has a default, so its extraction cannot fail.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parses an explicit argument list, for tests and embedding.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("Default config path should always be set"),
            ),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            instance_id: matches.get_one::<String>("instance-id").cloned(),
            redis_url: matches.get_one::<String>("redis-url").cloned(),
            data_dir: matches.get_one::<String>("data-dir").map(PathBuf::from),
        }
    }
}

fn command() -> Command {
    Command::new("Starfall Game Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Authoritative server for a chunked, procedurally generated space world")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address (e.g., 127.0.0.1:8080)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("instance-id")
                .long("instance-id")
                .value_name("ID")
                .help("Cluster identity of this instance (random when unset)"),
        )
        .arg(
            Arg::new("redis-url")
                .long("redis-url")
                .value_name("URL")
                .help("Redis URL for the shared state fabric (e.g., redis://127.0.0.1/)"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Directory for durable player and chunk records"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_config_toml_without_overrides() {
        let args = CliArgs::try_parse_from(["starfall"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("config.toml"));
        assert!(args.bind_address.is_none());
        assert!(args.redis_url.is_none());
        assert!(args.data_dir.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn every_override_is_captured() {
        let args = CliArgs::try_parse_from([
            "starfall",
            "-c",
            "prod.toml",
            "--bind",
            "0.0.0.0:9000",
            "--log-level",
            "debug",
            "--json-logs",
            "--instance-id",
            "eu-1",
            "--redis-url",
            "redis://cache/",
            "--data-dir",
            "/var/lib/starfall",
        ])
        .unwrap();
        assert_eq!(args.config_path, PathBuf::from("prod.toml"));
        assert_eq!(args.bind_address.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert_eq!(args.instance_id.as_deref(), Some("eu-1"));
        assert_eq!(args.redis_url.as_deref(), Some("redis://cache/"));
        assert_eq!(args.data_dir, Some(PathBuf::from("/var/lib/starfall")));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(CliArgs::try_parse_from(["starfall", "--plugins", "x"]).is_err());
    }
}
