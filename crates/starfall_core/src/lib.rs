//! # Starfall Core
//!
//! Authoritative world state for a persistent, chunk-based multiplayer space
//! game. Everything in this crate is owned by a single world loop per
//! process, so none of it takes locks; cross-instance coordination lives in
//! `starfall_cluster`.
//!
//! ## Core Features
//!
//! - **Zone Rules**: Safe, transition and hostile tiers derived from distance to the origin
//! - **Deterministic Generation**: Chunk content is a pure function of its coordinates
//! - **Chunk Lifecycle**: TTL and ceiling based eviction with a presence index
//! - **Hot State Cache**: In-memory player state with critical and batch flush tiers
//! - **Anti-Cheat**: Movement validation and sliding-window rate limiting
//! - **Combat**: Validated PvP with a death and respawn state machine
//!
//! ## Quick Start Example
//!
//! ```rust
//! use starfall_core::*;
//!
//! let mut chunks = ChunkManager::new(ContentGenerator::default(), EvictionPolicy::default());
//! let chunk = chunks.get_or_load(ChunkCoord::new(5, -3), current_timestamp_ms());
//! assert!(!chunk.asteroids.is_empty());
//! assert_eq!(chunk.zone.tier, ZoneTier::Safe);
//!
//! let mut cache = HotStateCache::default();
//! let id = PlayerId::from_account_name("vega");
//! let spawn = Position::new(500.0, 500.0);
//! cache.upsert_on_connect(id, PlayerState::new(id, "vega", spawn, ChunkCoord::ORIGIN, 0));
//! assert_eq!(cache.online_count(), 1);
//! ```

pub mod auth;
pub mod chunk;
pub mod combat;
pub mod generator;
pub mod movement;
pub mod persistence;
pub mod protocol;
pub mod random;
pub mod rate_limiter;
pub mod shutdown;
pub mod state;
pub mod types;
pub mod utils;
pub mod zone;

pub use auth::{AuthError, Authenticator, DevTokenAuthenticator, Identity};
pub use chunk::{Chunk, ChunkManager, ChunkStats, EvictionPolicy, EvictionReport};
pub use combat::{
    AttackOutcome, AttackRejection, CombatConfig, CombatResolver, LifeState, RespawnOutcome,
    RespawnRejection,
};
pub use generator::{Asteroid, ContentGenerator, GeneratedContent, GeneratorConfig, ResourceKind};
pub use movement::{
    MoveRejectReason, MoveRejection, MoveRequest, MovementConfig, MovementHistory, MovementSample,
    MovementTracker, MovementValidator,
};
pub use persistence::{
    BattleLogEntry, ChunkRecord, DurableStore, JsonFileStore, MemoryStore, PlayerRecord, StoreError,
};
pub use protocol::{InboundEvent, OutboundEvent, PeerInfo, ProtocolError};
pub use random::{hash_seed, pick_weighted, seeded_rng};
pub use rate_limiter::{
    EventLimits, LimitRule, LimitScope, RateEvent, RateLimitConfig, RateLimitRejection, RateLimiter,
    RateLimiterStats,
};
pub use shutdown::ShutdownState;
pub use state::{FlushReport, HotStateCache, PlayerState, StateError};
pub use types::{ChunkCoord, ConnectionId, PlayerId, Position};
pub use utils::{current_timestamp, current_timestamp_ms};
pub use zone::{zone_for, Biome, ContentDensity, ZoneDescriptor, ZoneTier};

pub use async_trait::async_trait;
