//! # Starfall Cluster
//!
//! Cross-instance coordination for Starfall game servers.
//!
//! ## Components
//!
//! - [`Fabric`]: TTL key/value and pub/sub over Redis, falling back to an
//!   in-process store whenever Redis is unreachable
//! - [`ClusterCoordinator`]: heartbeats, peer view and leader election
//! - [`InstanceSelector`]: load-aware routing of players to instances
//! - [`PlayerDirectory`]: which instance hosts which player
//!
//! Instances never call each other directly; everything travels through
//! the fabric.

pub mod coordinator;
pub mod directory;
pub mod fabric;
pub mod selector;

pub use coordinator::{
    elect_leader, ClusterCoordinator, ClusterEvent, CoordinatorConfig, InstanceRecord, PruneReport,
    ResourceSnapshot, EVENTS_CHANNEL,
};
pub use directory::{ClaimOutcome, HostClaim, PlayerDirectory};
pub use fabric::{
    Fabric, FabricBackend, FabricConfig, FabricError, FabricMode, FabricStats, MemoryBackend,
    RedisBackend,
};
pub use selector::{
    probe_instance, InstanceHealth, InstanceSelector, Selection, SelectionStrategy, SelectorConfig,
    SelectorError, SelectorStats,
};
