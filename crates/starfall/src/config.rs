//! Configuration management for the Starfall server.
//!
//! This module handles loading, validation, and conversion of server configuration
//! from TOML files. Every field has a default, so a partial file (or an empty
//! one) is a valid configuration.

use serde::{Deserialize, Serialize};
use starfall_cluster::{CoordinatorConfig, FabricConfig, SelectionStrategy, SelectorConfig};
use starfall_core::{
    ChunkCoord, CombatConfig, EventLimits, EvictionPolicy, GeneratorConfig, LimitRule,
    MovementConfig, Position, RateEvent, RateLimitConfig,
};
use starfall_server::{ClusterConfig, PersistenceConfig, ServerConfig, TaskIntervals, WorldConfig};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to write default config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub world: WorldSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_max_connections() -> usize { 1000 }
fn default_outbound_queue() -> usize { 256 }
fn default_command_queue() -> usize { 4096 }
fn default_stats_interval_ms() -> u64 { 60_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Queued outbound messages per connection before the client is dropped
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
            outbound_queue: default_outbound_queue(),
            command_queue: default_command_queue(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

// World defaults
fn default_chunk_size() -> f64 { 1000.0 }
fn default_world_radius_chunks() -> i32 { 1000 }
fn default_max_speed() -> f64 { 600.0 }
fn default_teleport_threshold() -> f64 { 1500.0 }
fn default_max_acceleration() -> f64 { 30_000.0 }
fn default_movement_history() -> usize { 8 }
fn default_movement_inactivity_ms() -> u64 { 300_000 }
fn default_chunk_ttl_ms() -> u64 { 300_000 }
fn default_max_loaded_chunks() -> usize { 2048 }
fn default_chunk_eviction_interval_ms() -> u64 { 30_000 }
fn default_prune_interval_ms() -> u64 { 30_000 }
fn default_mine_range() -> f64 { 150.0 }
fn default_spawn_x() -> f64 { 500.0 }
fn default_spawn_y() -> f64 { 500.0 }
fn default_asteroid_spacing() -> f64 { 60.0 }
fn default_asteroid_min_radius() -> f64 { 12.0 }
fn default_asteroid_max_radius() -> f64 { 40.0 }
fn default_attack_range() -> f64 { 400.0 }
fn default_crit_chance() -> f64 { 0.1 }
fn default_crit_multiplier() -> f64 { 2.0 }
fn default_respawn_delay_ms() -> u64 { 5000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: f64,
    /// Chunks from the origin, per axis, that players may reach
    #[serde(default = "default_world_radius_chunks")]
    pub world_radius_chunks: i32,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    #[serde(default = "default_teleport_threshold")]
    pub teleport_threshold: f64,
    #[serde(default = "default_max_acceleration")]
    pub max_acceleration: f64,
    #[serde(default = "default_movement_history")]
    pub movement_history: usize,
    #[serde(default = "default_movement_inactivity_ms")]
    pub movement_inactivity_ms: u64,
    #[serde(default = "default_chunk_ttl_ms")]
    pub chunk_ttl_ms: u64,
    #[serde(default = "default_max_loaded_chunks")]
    pub max_loaded_chunks: usize,
    #[serde(default = "default_chunk_eviction_interval_ms")]
    pub chunk_eviction_interval_ms: u64,
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
    #[serde(default = "default_mine_range")]
    pub mine_range: f64,
    /// New players and respawns appear here
    #[serde(default = "default_spawn_x")]
    pub spawn_x: f64,
    #[serde(default = "default_spawn_y")]
    pub spawn_y: f64,
    #[serde(default = "default_asteroid_spacing")]
    pub asteroid_spacing: f64,
    #[serde(default = "default_asteroid_min_radius")]
    pub asteroid_min_radius: f64,
    #[serde(default = "default_asteroid_max_radius")]
    pub asteroid_max_radius: f64,
    #[serde(default = "default_attack_range")]
    pub attack_range: f64,
    #[serde(default = "default_crit_chance")]
    pub crit_chance: f64,
    #[serde(default = "default_crit_multiplier")]
    pub crit_multiplier: f64,
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            world_radius_chunks: default_world_radius_chunks(),
            max_speed: default_max_speed(),
            teleport_threshold: default_teleport_threshold(),
            max_acceleration: default_max_acceleration(),
            movement_history: default_movement_history(),
            movement_inactivity_ms: default_movement_inactivity_ms(),
            chunk_ttl_ms: default_chunk_ttl_ms(),
            max_loaded_chunks: default_max_loaded_chunks(),
            chunk_eviction_interval_ms: default_chunk_eviction_interval_ms(),
            prune_interval_ms: default_prune_interval_ms(),
            mine_range: default_mine_range(),
            spawn_x: default_spawn_x(),
            spawn_y: default_spawn_y(),
            asteroid_spacing: default_asteroid_spacing(),
            asteroid_min_radius: default_asteroid_min_radius(),
            asteroid_max_radius: default_asteroid_max_radius(),
            attack_range: default_attack_range(),
            crit_chance: default_crit_chance(),
            crit_multiplier: default_crit_multiplier(),
            respawn_delay_ms: default_respawn_delay_ms(),
        }
    }
}

fn default_store_timeout_ms() -> u64 { 2000 }
fn default_critical_flush_ms() -> u64 { 250 }
fn default_batch_flush_ms() -> u64 { 5000 }
fn default_critical_failure_alert() -> u32 { 3 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSettings {
    /// JSON file store directory; state is kept in memory only when unset
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_critical_flush_ms")]
    pub critical_flush_ms: u64,
    #[serde(default = "default_batch_flush_ms")]
    pub batch_flush_ms: u64,
    #[serde(default = "default_critical_failure_alert")]
    pub critical_failure_alert: u32,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            store_timeout_ms: default_store_timeout_ms(),
            critical_flush_ms: default_critical_flush_ms(),
            batch_flush_ms: default_batch_flush_ms(),
            critical_failure_alert: default_critical_failure_alert(),
        }
    }
}

// Cluster defaults
fn default_capacity() -> usize { 1000 }
fn default_heartbeat_interval_ms() -> u64 { 5000 }
fn default_peer_timeout_ms() -> u64 { 15_000 }
fn default_record_ttl_ms() -> u64 { 15_000 }
fn default_election_interval_ms() -> u64 { 10_000 }
fn default_health_probe_interval_ms() -> u64 { 10_000 }
fn default_probe_timeout_ms() -> u64 { 500 }
fn default_failure_threshold() -> u32 { 3 }
fn default_response_time_alpha() -> f64 { 0.2 }
fn default_fabric_timeout_ms() -> u64 { 500 }
fn default_fabric_retry_ms() -> u64 { 5000 }
fn default_assignment_ttl_ms() -> u64 { 30_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Stable identity of this instance; a random UUID when unset
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Address handed to clients redirected here; `ws://{bind_address}` when unset
    #[serde(default)]
    pub advertise_address: Option<String>,
    /// Single-instance mode when unset
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Players this instance hosts before routing new ones elsewhere
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    #[serde(default = "default_record_ttl_ms")]
    pub record_ttl_ms: u64,
    #[serde(default = "default_election_interval_ms")]
    pub election_interval_ms: u64,
    #[serde(default = "default_health_probe_interval_ms")]
    pub health_probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default = "default_response_time_alpha")]
    pub response_time_alpha: f64,
    #[serde(default = "default_fabric_timeout_ms")]
    pub fabric_timeout_ms: u64,
    #[serde(default = "default_fabric_retry_ms")]
    pub fabric_retry_ms: u64,
    /// How long a routing decision for one player is reused
    #[serde(default = "default_assignment_ttl_ms")]
    pub assignment_ttl_ms: u64,
    /// Weighted-strategy weight per instance id; unlisted instances weigh 1.0
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            instance_id: None,
            advertise_address: None,
            redis_url: None,
            capacity: default_capacity(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            record_ttl_ms: default_record_ttl_ms(),
            election_interval_ms: default_election_interval_ms(),
            health_probe_interval_ms: default_health_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            strategy: SelectionStrategy::default(),
            response_time_alpha: default_response_time_alpha(),
            fabric_timeout_ms: default_fabric_timeout_ms(),
            fabric_retry_ms: default_fabric_retry_ms(),
            assignment_ttl_ms: default_assignment_ttl_ms(),
            weights: BTreeMap::new(),
        }
    }
}

// Rate limit defaults, per second unless noted
fn default_global_per_second() -> u32 { 5000 }
fn default_auth_attempts() -> u32 { 5 }
fn default_auth_window_ms() -> u64 { 60_000 }
fn default_move_per_second() -> u32 { 30 }
fn default_attack_per_second() -> u32 { 5 }
fn default_enter_chunk_per_second() -> u32 { 10 }
fn default_mine_per_second() -> u32 { 10 }
fn default_respawn_per_second() -> u32 { 2 }
fn default_stats_per_second() -> u32 { 2 }
fn default_warning_threshold() -> u32 { 5 }
fn default_block_base_ms() -> u64 { 10_000 }
fn default_warning_decay_ms() -> u64 { 60_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Server-wide events of each kind per second
    #[serde(default = "default_global_per_second")]
    pub global_per_second: u32,
    /// Authentication attempts per IP per `auth_window_ms`
    #[serde(default = "default_auth_attempts")]
    pub auth_attempts: u32,
    #[serde(default = "default_auth_window_ms")]
    pub auth_window_ms: u64,
    #[serde(default = "default_move_per_second")]
    pub move_per_second: u32,
    #[serde(default = "default_attack_per_second")]
    pub attack_per_second: u32,
    #[serde(default = "default_enter_chunk_per_second")]
    pub enter_chunk_per_second: u32,
    #[serde(default = "default_mine_per_second")]
    pub mine_per_second: u32,
    #[serde(default = "default_respawn_per_second")]
    pub respawn_per_second: u32,
    #[serde(default = "default_stats_per_second")]
    pub stats_per_second: u32,
    /// Rejections before the offending IP is blocked
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
    #[serde(default = "default_block_base_ms")]
    pub block_base_ms: u64,
    #[serde(default = "default_warning_decay_ms")]
    pub warning_decay_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global_per_second: default_global_per_second(),
            auth_attempts: default_auth_attempts(),
            auth_window_ms: default_auth_window_ms(),
            move_per_second: default_move_per_second(),
            attack_per_second: default_attack_per_second(),
            enter_chunk_per_second: default_enter_chunk_per_second(),
            mine_per_second: default_mine_per_second(),
            respawn_per_second: default_respawn_per_second(),
            stats_per_second: default_stats_per_second(),
            warning_threshold: default_warning_threshold(),
            block_base_ms: default_block_base_ms(),
            warning_decay_ms: default_warning_decay_ms(),
        }
    }
}

impl RateLimitSettings {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        let global = Some(LimitRule::new(self.global_per_second, 1000));
        let per_player = |max_count| EventLimits {
            per_ip: None,
            per_player: Some(LimitRule::new(max_count, 1000)),
            global,
        };

        let mut limits = BTreeMap::new();
        limits.insert(
            RateEvent::Authenticate,
            EventLimits {
                per_ip: Some(LimitRule::new(self.auth_attempts, self.auth_window_ms)),
                per_player: None,
                global,
            },
        );
        limits.insert(RateEvent::Move, per_player(self.move_per_second));
        limits.insert(RateEvent::Attack, per_player(self.attack_per_second));
        limits.insert(RateEvent::EnterChunk, per_player(self.enter_chunk_per_second));
        limits.insert(RateEvent::Mine, per_player(self.mine_per_second));
        limits.insert(RateEvent::Respawn, per_player(self.respawn_per_second));
        limits.insert(RateEvent::Stats, per_player(self.stats_per_second));

        RateLimitConfig {
            limits,
            warning_threshold: self.warning_threshold,
            block_base_ms: self.block_base_ms,
            warning_decay_ms: self.warning_decay_ms,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads the configuration at `path`, writing the defaults there first
    /// when the file does not exist.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let bind_address: SocketAddr = self.server.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!("Invalid bind address: {}", self.server.bind_address))
        })?;
        let world = &self.world;
        let spawn_point = Position::new(world.spawn_x, world.spawn_y);
        let spawn_chunk =
            ChunkCoord::containing(spawn_point, world.chunk_size).unwrap_or(ChunkCoord::ORIGIN);

        let mut coordinator = CoordinatorConfig {
            address: self
                .cluster
                .advertise_address
                .clone()
                .unwrap_or_else(|| format!("ws://{bind_address}")),
            capacity: self.cluster.capacity,
            record_ttl: ms(self.cluster.record_ttl_ms),
            heartbeat_interval: ms(self.cluster.heartbeat_interval_ms),
            peer_timeout: ms(self.cluster.peer_timeout_ms),
            election_interval: ms(self.cluster.election_interval_ms),
            ..CoordinatorConfig::default()
        };
        if let Some(id) = &self.cluster.instance_id {
            coordinator.instance_id = id.clone();
        }

        Ok(ServerConfig {
            bind_address,
            max_connections: self.server.max_connections,
            outbound_queue: self.server.outbound_queue,
            command_queue: self.server.command_queue,
            world: WorldConfig {
                generator: GeneratorConfig {
                    chunk_size: world.chunk_size,
                    min_spacing: world.asteroid_spacing,
                    min_radius: world.asteroid_min_radius,
                    max_radius: world.asteroid_max_radius,
                    ..GeneratorConfig::default()
                },
                eviction: EvictionPolicy {
                    ttl_ms: world.chunk_ttl_ms,
                    max_loaded: world.max_loaded_chunks,
                },
                movement: MovementConfig {
                    chunk_size: world.chunk_size,
                    max_speed: world.max_speed,
                    teleport_threshold: world.teleport_threshold,
                    max_acceleration: world.max_acceleration,
                    world_radius_chunks: world.world_radius_chunks,
                    history_len: world.movement_history,
                    inactivity_ms: world.movement_inactivity_ms,
                },
                combat: CombatConfig {
                    max_range: world.attack_range,
                    crit_chance: world.crit_chance,
                    crit_multiplier: world.crit_multiplier,
                    respawn_delay_ms: world.respawn_delay_ms,
                    respawn_point: spawn_point,
                    respawn_chunk: spawn_chunk,
                },
                mine_range: world.mine_range,
                spawn_point,
            },
            rate_limits: self.rate_limits.to_rate_limit_config(),
            tasks: TaskIntervals {
                critical_flush: ms(self.persistence.critical_flush_ms),
                batch_flush: ms(self.persistence.batch_flush_ms),
                chunk_eviction: ms(world.chunk_eviction_interval_ms),
                prune_sweep: ms(world.prune_interval_ms),
                health_probe: ms(self.cluster.health_probe_interval_ms),
                stats_monitor: ms(self.server.stats_interval_ms),
            },
            persistence: PersistenceConfig {
                data_dir: self.persistence.data_dir.as_ref().map(PathBuf::from),
                store_timeout: ms(self.persistence.store_timeout_ms),
                critical_failure_alert: self.persistence.critical_failure_alert,
            },
            cluster: ClusterConfig {
                redis_url: self.cluster.redis_url.clone(),
                fabric: FabricConfig {
                    command_timeout: ms(self.cluster.fabric_timeout_ms),
                    retry_interval: ms(self.cluster.fabric_retry_ms),
                    ..FabricConfig::default()
                },
                coordinator,
                selector: SelectorConfig {
                    strategy: self.cluster.strategy,
                    failure_threshold: self.cluster.failure_threshold,
                    response_time_alpha: self.cluster.response_time_alpha,
                    probe_timeout: ms(self.cluster.probe_timeout_ms),
                    assignment_ttl: ms(self.cluster.assignment_ttl_ms),
                    weights: self.cluster.weights.clone().into_iter().collect(),
                },
            },
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        // Validate bind address
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.server.bind_address
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        let capacities = [
            ("server.max_connections", self.server.max_connections),
            ("server.outbound_queue", self.server.outbound_queue),
            ("server.command_queue", self.server.command_queue),
            ("world.max_loaded_chunks", self.world.max_loaded_chunks),
            ("world.movement_history", self.world.movement_history),
            ("cluster.capacity", self.cluster.capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }

        let intervals = [
            ("server.stats_interval_ms", self.server.stats_interval_ms),
            ("world.chunk_ttl_ms", self.world.chunk_ttl_ms),
            ("world.chunk_eviction_interval_ms", self.world.chunk_eviction_interval_ms),
            ("world.prune_interval_ms", self.world.prune_interval_ms),
            ("persistence.store_timeout_ms", self.persistence.store_timeout_ms),
            ("persistence.critical_flush_ms", self.persistence.critical_flush_ms),
            ("persistence.batch_flush_ms", self.persistence.batch_flush_ms),
            ("cluster.heartbeat_interval_ms", self.cluster.heartbeat_interval_ms),
            ("cluster.election_interval_ms", self.cluster.election_interval_ms),
            ("cluster.health_probe_interval_ms", self.cluster.health_probe_interval_ms),
            ("cluster.probe_timeout_ms", self.cluster.probe_timeout_ms),
            ("cluster.fabric_timeout_ms", self.cluster.fabric_timeout_ms),
            ("cluster.fabric_retry_ms", self.cluster.fabric_retry_ms),
            ("cluster.assignment_ttl_ms", self.cluster.assignment_ttl_ms),
            ("rate_limits.auth_window_ms", self.rate_limits.auth_window_ms),
            ("rate_limits.block_base_ms", self.rate_limits.block_base_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }

        let limits = [
            ("rate_limits.global_per_second", self.rate_limits.global_per_second),
            ("rate_limits.auth_attempts", self.rate_limits.auth_attempts),
            ("rate_limits.move_per_second", self.rate_limits.move_per_second),
            ("rate_limits.attack_per_second", self.rate_limits.attack_per_second),
            ("rate_limits.enter_chunk_per_second", self.rate_limits.enter_chunk_per_second),
            ("rate_limits.mine_per_second", self.rate_limits.mine_per_second),
            ("rate_limits.respawn_per_second", self.rate_limits.respawn_per_second),
            ("rate_limits.stats_per_second", self.rate_limits.stats_per_second),
            ("rate_limits.warning_threshold", self.rate_limits.warning_threshold),
            ("persistence.critical_failure_alert", self.persistence.critical_failure_alert),
            ("cluster.failure_threshold", self.cluster.failure_threshold),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }

        let world = &self.world;
        let distances = [
            ("world.chunk_size", world.chunk_size),
            ("world.max_speed", world.max_speed),
            ("world.teleport_threshold", world.teleport_threshold),
            ("world.max_acceleration", world.max_acceleration),
            ("world.mine_range", world.mine_range),
            ("world.attack_range", world.attack_range),
            ("world.asteroid_spacing", world.asteroid_spacing),
            ("world.asteroid_min_radius", world.asteroid_min_radius),
        ];
        for (name, value) in distances {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{name} must be a positive number"));
            }
        }
        if world.world_radius_chunks <= 0 {
            return Err("world.world_radius_chunks must be greater than 0".to_string());
        }
        if world.asteroid_min_radius > world.asteroid_max_radius {
            return Err("world.asteroid_min_radius must not exceed world.asteroid_max_radius".to_string());
        }
        if !(0.0..=1.0).contains(&world.crit_chance) {
            return Err("world.crit_chance must be between 0 and 1".to_string());
        }
        if !world.crit_multiplier.is_finite() || world.crit_multiplier < 1.0 {
            return Err("world.crit_multiplier must be at least 1".to_string());
        }
        let extent = world.chunk_size * f64::from(world.world_radius_chunks);
        if !world.spawn_x.is_finite()
            || !world.spawn_y.is_finite()
            || world.spawn_x.abs() >= extent
            || world.spawn_y.abs() >= extent
        {
            return Err(format!(
                "Spawn point ({}, {}) lies outside the world",
                world.spawn_x, world.spawn_y
            ));
        }

        if self.persistence.critical_flush_ms > self.persistence.batch_flush_ms {
            return Err("persistence.critical_flush_ms must not exceed persistence.batch_flush_ms".to_string());
        }
        if self.persistence.store_timeout_ms >= self.persistence.batch_flush_ms {
            return Err("persistence.store_timeout_ms must be shorter than persistence.batch_flush_ms".to_string());
        }
        if self.cluster.peer_timeout_ms <= self.cluster.heartbeat_interval_ms {
            return Err("cluster.peer_timeout_ms must exceed cluster.heartbeat_interval_ms".to_string());
        }
        if self.cluster.record_ttl_ms <= self.cluster.heartbeat_interval_ms {
            return Err("cluster.record_ttl_ms must exceed cluster.heartbeat_interval_ms".to_string());
        }
        if !(self.cluster.response_time_alpha > 0.0 && self.cluster.response_time_alpha <= 1.0) {
            return Err("cluster.response_time_alpha must be in (0, 1]".to_string());
        }
        for (id, weight) in &self.cluster.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(format!("cluster.weights.{id} must be a non-negative number"));
            }
        }
        if let Some(id) = &self.cluster.instance_id {
            if id.trim().is_empty() {
                return Err("cluster.instance_id cannot be empty".to_string());
            }
        }
        if let Some(url) = &self.cluster.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(format!("Invalid Redis URL: {url}"));
            }
        }

        Ok(())
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.server.bind_address, "127.0.0.1:8080");
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.world.chunk_size, 1000.0);
        assert_eq!(config.world.max_speed, 600.0);
        assert_eq!(config.rate_limits.move_per_second, 30);
        assert_eq!(config.cluster.capacity, 1000);
        assert!(config.cluster.redis_url.is_none());
        assert!(config.persistence.data_dir.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
    }

    #[test]
    fn defaults_match_the_runtime_defaults() {
        let converted = AppConfig::default().to_server_config().unwrap();
        let runtime = ServerConfig::default();

        assert_eq!(converted.bind_address, runtime.bind_address);
        assert_eq!(converted.max_connections, runtime.max_connections);
        assert_eq!(converted.world.movement, runtime.world.movement);
        assert_eq!(converted.world.combat, runtime.world.combat);
        assert_eq!(converted.world.generator, runtime.world.generator);
        assert_eq!(converted.world.eviction, runtime.world.eviction);
        assert_eq!(converted.world.spawn_point, runtime.world.spawn_point);
        assert_eq!(converted.rate_limits, runtime.rate_limits);
        assert_eq!(converted.tasks.critical_flush, runtime.tasks.critical_flush);
        assert_eq!(converted.tasks.stats_monitor, runtime.tasks.stats_monitor);
        assert_eq!(converted.persistence.store_timeout, runtime.persistence.store_timeout);
        assert_eq!(
            converted.persistence.critical_failure_alert,
            runtime.persistence.critical_failure_alert
        );
        assert_eq!(converted.cluster.coordinator.address, "ws://127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:8080");
        assert!(path.exists());

        // the file written on first start loads back to the same settings
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.world.teleport_threshold, config.world.teleport_threshold);
        assert_eq!(reloaded.cluster.strategy, config.cluster.strategy);
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let toml_content = r#"
[server]
bind_address = "0.0.0.0:3000"

[world]
chunk_size = 500.0
spawn_x = 250.0
spawn_y = 250.0

[persistence]
data_dir = "/tmp/starfall"

[cluster]
instance_id = "eu-1"
redis_url = "redis://127.0.0.1/"
strategy = "weighted"

[cluster.weights]
eu-2 = 3.0
eu-3 = 0.5

[rate_limits]
move_per_second = 20
"#;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("starfall.toml");
        tokio::fs::write(&path, toml_content).await.unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:3000");
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.world.chunk_size, 500.0);
        assert_eq!(config.world.max_speed, 600.0);
        assert_eq!(config.cluster.strategy, SelectionStrategy::Weighted);
        assert!(config.validate().is_ok());

        let server = config.to_server_config().unwrap();
        assert_eq!(server.instance_id(), "eu-1");
        assert_eq!(server.cluster.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(server.cluster.selector.weights.get("eu-2"), Some(&3.0));
        assert_eq!(server.cluster.selector.weights.get("eu-3"), Some(&0.5));
        assert_eq!(server.cluster.selector.assignment_ttl, Duration::from_secs(30));
        assert_eq!(server.persistence.data_dir, Some(PathBuf::from("/tmp/starfall")));
        assert_eq!(server.world.movement.chunk_size, 500.0);
        assert_eq!(server.world.generator.chunk_size, 500.0);
        assert_eq!(server.world.combat.respawn_point, Position::new(250.0, 250.0));
        assert_eq!(
            server.rate_limits.limits[&RateEvent::Move].per_player,
            Some(LimitRule::new(20, 1000))
        );
    }

    #[tokio::test]
    async fn malformed_file_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "[server\nbind_address = 1").await.unwrap();

        assert!(matches!(
            AppConfig::load_from_file(&path).await,
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn respawn_chunk_follows_the_spawn_point() {
        let mut config = AppConfig::default();
        config.world.spawn_x = 2_500.0;
        config.world.spawn_y = -10.0;
        let server = config.to_server_config().unwrap();
        assert_eq!(server.world.combat.respawn_chunk, ChunkCoord::new(2, -1));
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_bind_address() {
        let mut config = AppConfig::default();
        config.server.bind_address = "invalid_address".to_string();

        let result = config.validate();
        assert!(result.unwrap_err().contains("Invalid bind address"));
        assert!(matches!(config.to_server_config(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));
    }

    #[test]
    fn zero_capacities_and_intervals_are_rejected() {
        let mut config = AppConfig::default();
        config.cluster.capacity = 0;
        assert!(config.validate().unwrap_err().contains("cluster.capacity"));

        let mut config = AppConfig::default();
        config.persistence.critical_flush_ms = 0;
        assert!(config.validate().unwrap_err().contains("critical_flush_ms"));

        let mut config = AppConfig::default();
        config.rate_limits.move_per_second = 0;
        assert!(config.validate().unwrap_err().contains("move_per_second"));
    }

    #[test]
    fn inconsistent_thresholds_are_rejected() {
        let mut config = AppConfig::default();
        config.cluster.peer_timeout_ms = config.cluster.heartbeat_interval_ms;
        assert!(config.validate().unwrap_err().contains("peer_timeout_ms"));

        let mut config = AppConfig::default();
        config.world.asteroid_min_radius = 50.0;
        assert!(config.validate().unwrap_err().contains("asteroid_min_radius"));

        let mut config = AppConfig::default();
        config.world.crit_chance = 1.5;
        assert!(config.validate().unwrap_err().contains("crit_chance"));

        let mut config = AppConfig::default();
        config.world.spawn_x = 2.0e6;
        assert!(config.validate().unwrap_err().contains("outside the world"));

        let mut config = AppConfig::default();
        config.cluster.redis_url = Some("localhost:6379".to_string());
        assert!(config.validate().unwrap_err().contains("Redis URL"));

        let mut config = AppConfig::default();
        config.cluster.weights.insert("eu-2".to_string(), -1.0);
        assert!(config.validate().unwrap_err().contains("cluster.weights.eu-2"));
    }
}
