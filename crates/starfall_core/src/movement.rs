//! # Movement Validation
//!
//! Server-side anti-cheat for position updates. The validator is a pure
//! decision over the incoming sample, the player's accepted history and the
//! player's current state. Checks run in a fixed order and the first failure
//! wins:
//!
//! 1. structural validity (finite, inside the world extent, claimed chunk matches)
//! 2. timestamp strictly after the last accepted sample
//! 3. implied speed within `max_speed`
//! 4. displacement within `teleport_threshold`
//! 5. implied acceleration within `max_acceleration`
//! 6. destination chunk inside `world_radius_chunks`
//!
//! A rejection carries the last known-good position so the client can be
//! snapped back. Only accepted samples enter the history.

use crate::state::PlayerState;
use crate::types::{ChunkCoord, PlayerId, Position};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::debug;

/// Movement limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementConfig {
    pub chunk_size: f64,
    /// Units per second
    pub max_speed: f64,
    /// Largest straight-line jump accepted in one sample
    pub teleport_threshold: f64,
    /// Units per second squared
    pub max_acceleration: f64,
    /// Chunks beyond this distance on either axis are out of bounds
    pub world_radius_chunks: i32,
    /// Samples kept per player
    pub history_len: usize,
    /// Histories idle for longer than this are discarded
    pub inactivity_ms: u64,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000.0,
            max_speed: 600.0,
            teleport_threshold: 1500.0,
            max_acceleration: 30_000.0,
            world_radius_chunks: 1000,
            history_len: 8,
            inactivity_ms: 300_000,
        }
    }
}

impl MovementConfig {
    /// Largest absolute coordinate that is structurally valid. This sits one
    /// chunk past the playable area so out-of-bounds moves are reported as such.
    pub fn world_extent(&self) -> f64 {
        (self.world_radius_chunks as f64 + 2.0) * self.chunk_size
    }
}

/// One accepted position sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementSample {
    pub position: Position,
    pub timestamp: u64,
}

/// An incoming movement request, stamped by the server on arrival.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveRequest {
    pub position: Position,
    pub claimed_chunk: Option<ChunkCoord>,
    pub timestamp: u64,
}

/// Why a movement was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MoveRejectReason {
    InvalidCoordinates,
    ChunkMismatch { claimed: ChunkCoord, actual: ChunkCoord },
    StaleTimestamp,
    SpeedExceeded { speed: f64, max: f64 },
    Teleport { distance: f64, max: f64 },
    AccelerationExceeded { acceleration: f64, max: f64 },
    OutOfBounds { chunk: ChunkCoord },
}

impl MoveRejectReason {
    /// Short machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            MoveRejectReason::InvalidCoordinates => "invalid_coordinates",
            MoveRejectReason::ChunkMismatch { .. } => "chunk_mismatch",
            MoveRejectReason::StaleTimestamp => "stale_timestamp",
            MoveRejectReason::SpeedExceeded { .. } => "speed_exceeded",
            MoveRejectReason::Teleport { .. } => "teleport",
            MoveRejectReason::AccelerationExceeded { .. } => "acceleration_exceeded",
            MoveRejectReason::OutOfBounds { .. } => "out_of_bounds",
        }
    }
}

impl fmt::Display for MoveRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveRejectReason::InvalidCoordinates => write!(f, "invalid coordinates"),
            MoveRejectReason::ChunkMismatch { claimed, actual } => {
                write!(f, "claimed chunk {} but position is in {}", claimed, actual)
            }
            MoveRejectReason::StaleTimestamp => write!(f, "timestamp not after last sample"),
            MoveRejectReason::SpeedExceeded { speed, max } => {
                write!(f, "speed {:.1} exceeds {:.1}", speed, max)
            }
            MoveRejectReason::Teleport { distance, max } => {
                write!(f, "jump of {:.1} exceeds {:.1}", distance, max)
            }
            MoveRejectReason::AccelerationExceeded { acceleration, max } => {
                write!(f, "acceleration {:.1} exceeds {:.1}", acceleration, max)
            }
            MoveRejectReason::OutOfBounds { chunk } => write!(f, "chunk {} is outside the world", chunk),
        }
    }
}

/// A rejected move plus the position the client must return to.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRejection {
    pub reason: MoveRejectReason,
    pub last_good: Position,
}

/// Bounded, oldest-first list of accepted samples for one player.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementHistory {
    samples: VecDeque<MovementSample>,
    capacity: usize,
}

impl MovementHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(3);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: MovementSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn last(&self) -> Option<&MovementSample> {
        self.samples.back()
    }

    /// The sample before the last one.
    pub fn previous(&self) -> Option<&MovementSample> {
        let len = self.samples.len();
        if len < 2 {
            return None;
        }
        self.samples.get(len - 2)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MovementSample> {
        self.samples.iter()
    }
}

/// Stateless movement validator.
#[derive(Debug, Clone, Default)]
pub struct MovementValidator {
    config: MovementConfig,
}

impl MovementValidator {
    pub fn new(config: MovementConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MovementConfig {
        &self.config
    }

    /// Validates a move. On success returns the destination chunk.
    pub fn validate(
        &self,
        request: &MoveRequest,
        history: &MovementHistory,
        player: &PlayerState,
    ) -> Result<ChunkCoord, MoveRejection> {
        let reject = |reason: MoveRejectReason| MoveRejection {
            reason,
            last_good: player.position,
        };
        let cfg = &self.config;
        let target = request.position;

        // 1. structural validity
        let extent = cfg.world_extent();
        if !target.is_finite() || target.x.abs() > extent || target.y.abs() > extent {
            return Err(reject(MoveRejectReason::InvalidCoordinates));
        }
        let chunk = ChunkCoord::containing(target, cfg.chunk_size)
            .ok_or_else(|| reject(MoveRejectReason::InvalidCoordinates))?;
        if let Some(claimed) = request.claimed_chunk {
            if claimed != chunk {
                return Err(reject(MoveRejectReason::ChunkMismatch { claimed, actual: chunk }));
            }
        }

        if let Some(last) = history.last() {
            // 2. monotonic timestamps
            if request.timestamp <= last.timestamp {
                return Err(reject(MoveRejectReason::StaleTimestamp));
            }
            let dt = (request.timestamp - last.timestamp) as f64 / 1000.0;
            let distance = last.position.distance(target);

            // 3. speed
            let speed = distance / dt;
            if speed > cfg.max_speed {
                return Err(reject(MoveRejectReason::SpeedExceeded {
                    speed,
                    max: cfg.max_speed,
                }));
            }

            // 4. teleport
            if distance > cfg.teleport_threshold {
                return Err(reject(MoveRejectReason::Teleport {
                    distance,
                    max: cfg.teleport_threshold,
                }));
            }

            // 5. acceleration over (previous, last, new)
            if let Some(previous) = history.previous() {
                let acceleration = implied_acceleration(previous, last, &MovementSample {
                    position: target,
                    timestamp: request.timestamp,
                });
                if acceleration > cfg.max_acceleration {
                    return Err(reject(MoveRejectReason::AccelerationExceeded {
                        acceleration,
                        max: cfg.max_acceleration,
                    }));
                }
            }
        } else {
            let distance = player.position.distance(target);
            if distance > cfg.teleport_threshold {
                return Err(reject(MoveRejectReason::Teleport {
                    distance,
                    max: cfg.teleport_threshold,
                }));
            }
        }

        // 6. world bounds
        let radius = cfg.world_radius_chunks;
        if chunk.x.unsigned_abs() > radius.unsigned_abs() || chunk.y.unsigned_abs() > radius.unsigned_abs() {
            return Err(reject(MoveRejectReason::OutOfBounds { chunk }));
        }

        Ok(chunk)
    }
}

/// Magnitude of the velocity change across three samples, divided by the mean
/// of the two intervals.
fn implied_acceleration(a: &MovementSample, b: &MovementSample, c: &MovementSample) -> f64 {
    let dt1 = (b.timestamp.saturating_sub(a.timestamp)).max(1) as f64 / 1000.0;
    let dt2 = (c.timestamp.saturating_sub(b.timestamp)).max(1) as f64 / 1000.0;
    let v1 = ((b.position.x - a.position.x) / dt1, (b.position.y - a.position.y) / dt1);
    let v2 = ((c.position.x - b.position.x) / dt2, (c.position.y - b.position.y) / dt2);
    let dv = ((v2.0 - v1.0).powi(2) + (v2.1 - v1.1).powi(2)).sqrt();
    dv / ((dt1 + dt2) / 2.0)
}

#[derive(Debug, Clone)]
struct TrackedHistory {
    history: MovementHistory,
    last_seen: u64,
}

/// Per-player movement histories.
#[derive(Debug)]
pub struct MovementTracker {
    histories: HashMap<PlayerId, TrackedHistory>,
    capacity: usize,
    inactivity_ms: u64,
}

impl MovementTracker {
    pub fn new(capacity: usize, inactivity_ms: u64) -> Self {
        Self {
            histories: HashMap::new(),
            capacity,
            inactivity_ms,
        }
    }

    pub fn from_config(config: &MovementConfig) -> Self {
        Self::new(config.history_len, config.inactivity_ms)
    }

    /// Starts a fresh history at a known-good position (connect, respawn).
    pub fn seed(&mut self, player: PlayerId, position: Position, now: u64) {
        let mut history = MovementHistory::new(self.capacity);
        history.push(MovementSample {
            position,
            timestamp: now,
        });
        self.histories.insert(player, TrackedHistory { history, last_seen: now });
    }

    /// History for a player; an empty one if the player has none yet.
    pub fn history(&self, player: PlayerId) -> MovementHistory {
        self.histories
            .get(&player)
            .map(|tracked| tracked.history.clone())
            .unwrap_or_else(|| MovementHistory::new(self.capacity))
    }

    pub fn history_ref(&self, player: PlayerId) -> Option<&MovementHistory> {
        self.histories.get(&player).map(|tracked| &tracked.history)
    }

    /// Appends an accepted sample.
    pub fn record(&mut self, player: PlayerId, sample: MovementSample) {
        let capacity = self.capacity;
        let tracked = self.histories.entry(player).or_insert_with(|| TrackedHistory {
            history: MovementHistory::new(capacity),
            last_seen: sample.timestamp,
        });
        tracked.history.push(sample);
        tracked.last_seen = sample.timestamp;
    }

    pub fn remove(&mut self, player: PlayerId) {
        self.histories.remove(&player);
    }

    /// Drops histories idle for longer than the inactivity window.
    pub fn prune_inactive(&mut self, now: u64) -> usize {
        let before = self.histories.len();
        let window = self.inactivity_ms;
        self.histories
            .retain(|_, tracked| now.saturating_sub(tracked.last_seen) <= window);
        let pruned = before - self.histories.len();
        if pruned > 0 {
            debug!("🧹 Pruned {} idle movement histories", pruned);
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}
