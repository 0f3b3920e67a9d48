//! Operational stats snapshot.
//!
//! One [`StatsSnapshot`] per instance is logged by the stats monitor,
//! published on the fabric with every heartbeat and returned to clients that
//! send a `stats` request.

use crate::world::WorldStats;
use serde::{Deserialize, Serialize};
use starfall_cluster::{FabricStats, SelectorStats};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub instance_id: String,
    pub timestamp: u64,
    /// Live transport connections, authenticated or not
    pub connections: usize,
    pub world: WorldStats,
    pub fabric: FabricStats,
    pub selector: SelectorStats,
    pub leader: Option<String>,
    pub is_leader: bool,
    pub peer_count: usize,
}

impl StatsSnapshot {
    pub fn player_count(&self) -> usize {
        self.world.online_players
    }

    pub fn pending_flushes(&self) -> (usize, usize) {
        (self.world.pending_critical, self.world.pending_batch)
    }
}
