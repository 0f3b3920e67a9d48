//! Server configuration types and defaults.
//!
//! [`ServerConfig`] is the fully resolved runtime configuration. The binary
//! builds it from its TOML file; tests usually start from the defaults and
//! tweak individual fields.

use starfall_cluster::{CoordinatorConfig, FabricConfig, SelectorConfig};
use starfall_core::state::DEFAULT_CRITICAL_FAILURE_ALERT;
use starfall_core::{
    CombatConfig, EvictionPolicy, GeneratorConfig, MovementConfig, Position, RateLimitConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure for the game server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The socket address to bind the WebSocket listener to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Per-connection outbound queue length; slow clients past this are dropped
    pub outbound_queue: usize,

    /// World loop command queue length
    pub command_queue: usize,

    pub world: WorldConfig,

    pub rate_limits: RateLimitConfig,

    pub tasks: TaskIntervals,

    pub persistence: PersistenceConfig,

    pub cluster: ClusterConfig,
}

/// Gameplay rules owned by the world loop.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub generator: GeneratorConfig,
    pub eviction: EvictionPolicy,
    pub movement: MovementConfig,
    pub combat: CombatConfig,
    /// Largest player-to-asteroid distance for mining
    pub mine_range: f64,
    /// Where brand new players appear
    pub spawn_point: Position,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig::default(),
            eviction: EvictionPolicy::default(),
            movement: MovementConfig::default(),
            combat: CombatConfig::default(),
            mine_range: 150.0,
            spawn_point: Position::new(500.0, 500.0),
        }
    }
}

/// Periods of the supervised background tasks.
#[derive(Debug, Clone)]
pub struct TaskIntervals {
    pub critical_flush: Duration,
    pub batch_flush: Duration,
    pub chunk_eviction: Duration,
    pub prune_sweep: Duration,
    pub health_probe: Duration,
    pub stats_monitor: Duration,
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            critical_flush: Duration::from_millis(250),
            batch_flush: Duration::from_secs(5),
            chunk_eviction: Duration::from_secs(30),
            prune_sweep: Duration::from_secs(30),
            health_probe: Duration::from_secs(10),
            stats_monitor: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Directory for the JSON file store; in-memory storage when unset
    pub data_dir: Option<PathBuf>,
    /// Upper bound on one durable store round-trip
    pub store_timeout: Duration,
    /// Consecutive critical flush failures before operators are alerted
    pub critical_failure_alert: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            store_timeout: Duration::from_secs(2),
            critical_failure_alert: DEFAULT_CRITICAL_FAILURE_ALERT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Redis URL for the shared state fabric; single-instance mode when unset
    pub redis_url: Option<String>,
    pub fabric: FabricConfig,
    pub coordinator: CoordinatorConfig,
    pub selector: SelectorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: 1000,
            outbound_queue: 256,
            command_queue: 4096,
            world: WorldConfig::default(),
            rate_limits: RateLimitConfig::default(),
            tasks: TaskIntervals::default(),
            persistence: PersistenceConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn instance_id(&self) -> &str {
        &self.cluster.coordinator.instance_id
    }
}
