//! # Starfall Server
//!
//! The game server process core: one world loop that owns all gameplay
//! state, a WebSocket transport in front of it and the cluster services
//! beside it.
//!
//! ## Architecture
//!
//! ```text
//!  WebSocket tasks ──┐                         ┌──► DurableStore
//!                    ├─► WorldCommand (mpsc) ─► World loop
//!  periodic tickers ─┘                         └──► Fabric (claims, heartbeats, stats)
//! ```
//!
//! - [`world`]: gameplay handlers over the hot state cache and chunk manager
//! - [`runtime`]: the world loop, its command API and periodic tasks
//! - [`transport`]: WebSocket framing for one connection
//! - [`server`]: [`GameServer`], service construction and the accept loop
//!
//! Tests and tools can drive a world without sockets through
//! [`spawn_world`] and [`WorldHandle`].

pub mod config;
pub mod error;
pub mod runtime;
pub mod server;
pub mod stats;
pub mod transport;
pub mod world;

pub use config::{ClusterConfig, PersistenceConfig, ServerConfig, TaskIntervals, WorldConfig};
pub use error::ServerError;
pub use runtime::{
    spawn_periodic_tasks, spawn_world, Outbound, RuntimeServices, Tick, WorldCommand, WorldHandle,
};
pub use server::{build_services, GameServer};
pub use stats::StatsSnapshot;
pub use world::{Departure, Dispatch, MineRejection, World, WorldStats};

/// Creates a server with the given configuration.
pub async fn create_server_with_config(config: ServerConfig) -> Result<GameServer, ServerError> {
    GameServer::new(config).await
}
