//! # Chunk Lifecycle Manager
//!
//! Owns every chunk loaded in this process. A chunk is generated the first
//! time someone enters it, kept while it is visited, and dropped again once
//! it has been idle for longer than the eviction TTL or the cache grows past
//! its ceiling. Because generation is deterministic, dropping a chunk loses
//! nothing but its ephemeral depletion overlay.
//!
//! ## Presence
//!
//! The manager also keeps the presence index (which players are in which
//! chunk). Occupied chunks are never evicted, regardless of TTL or ceiling.
//!
//! ## Persistence
//!
//! Each first-time generation queues a [`ChunkRecord`]. The runtime drains
//! the queue on the batch flush tick and requeues it on store failure.

use crate::generator::{Asteroid, ContentGenerator, GeneratedContent};
use crate::persistence::ChunkRecord;
use crate::types::{ChunkCoord, PlayerId};
use crate::zone::ZoneDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// When loaded chunks may be dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionPolicy {
    /// Idle time after which an unoccupied chunk is evicted
    pub ttl_ms: u64,
    /// Maximum number of loaded chunks before forced eviction
    pub max_loaded: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            max_loaded: 2048,
        }
    }
}

/// A loaded chunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub coord: ChunkCoord,
    pub zone: ZoneDescriptor,
    pub seed: String,
    pub seed_hash: u64,
    pub asteroids: Vec<Asteroid>,
    pub loaded_at: u64,
    pub last_access: u64,
    pub access_count: u64,
    depleted: HashSet<u32>,
}

impl Chunk {
    fn from_content(content: GeneratedContent, now: u64) -> Self {
        Self {
            coord: content.coord,
            zone: content.zone,
            seed: content.seed,
            seed_hash: content.seed_hash,
            asteroids: content.asteroids,
            loaded_at: now,
            last_access: now,
            access_count: 1,
            depleted: HashSet::new(),
        }
    }

    pub fn asteroid(&self, id: u32) -> Option<&Asteroid> {
        self.asteroids.iter().find(|a| a.id == id)
    }

    pub fn is_depleted(&self, id: u32) -> bool {
        self.depleted.contains(&id)
    }

    /// Asteroids that can still be mined.
    pub fn available_asteroids(&self) -> impl Iterator<Item = &Asteroid> {
        self.asteroids.iter().filter(|a| !self.depleted.contains(&a.id))
    }

    pub fn depleted_count(&self) -> usize {
        self.depleted.len()
    }

    fn record(&self) -> ChunkRecord {
        ChunkRecord {
            coord: self.coord,
            seed: self.seed.clone(),
            seed_hash: self.seed_hash,
            tier: self.zone.tier,
            asteroid_count: self.asteroids.len(),
            generated_at: self.loaded_at,
        }
    }
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub expired: Vec<ChunkCoord>,
    pub forced: Vec<ChunkCoord>,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.expired.len() + self.forced.len()
    }
}

/// Chunk cache counters for stats snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub loaded: usize,
    pub ceiling: usize,
    pub occupied: usize,
    pub generated_total: u64,
    pub evicted_total: u64,
}

/// Owner of all loaded chunks and the presence index.
#[derive(Debug)]
pub struct ChunkManager {
    generator: ContentGenerator,
    policy: EvictionPolicy,
    chunks: HashMap<ChunkCoord, Chunk>,
    presence: HashMap<ChunkCoord, HashSet<PlayerId>>,
    pending_records: Vec<ChunkRecord>,
    generated_total: u64,
    evicted_total: u64,
}

impl ChunkManager {
    pub fn new(generator: ContentGenerator, policy: EvictionPolicy) -> Self {
        Self {
            generator,
            policy,
            chunks: HashMap::new(),
            presence: HashMap::new(),
            pending_records: Vec::new(),
            generated_total: 0,
            evicted_total: 0,
        }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    pub fn chunk_size(&self) -> f64 {
        self.generator.config().chunk_size
    }

    /// Returns the chunk at `coord`, generating it on first access.
    pub fn get_or_load(&mut self, coord: ChunkCoord, now: u64) -> &Chunk {
        self.get_or_load_mut(coord, now)
    }

    fn get_or_load_mut(&mut self, coord: ChunkCoord, now: u64) -> &mut Chunk {
        let generator = &self.generator;
        let pending = &mut self.pending_records;
        let generated_total = &mut self.generated_total;
        let mut created = false;

        let chunk = self.chunks.entry(coord).or_insert_with(|| {
            let chunk = Chunk::from_content(generator.generate(coord), now);
            debug!(
                "🌌 Generated chunk {} ({}, {} asteroids)",
                coord,
                chunk.zone.tier.name(),
                chunk.asteroids.len()
            );
            pending.push(chunk.record());
            *generated_total += 1;
            created = true;
            chunk
        });

        if !created {
            chunk.last_access = chunk.last_access.max(now);
            chunk.access_count += 1;
        }
        chunk
    }

    /// Returns a loaded chunk without touching access metadata.
    pub fn get(&self, coord: ChunkCoord) -> Option<&Chunk> {
        self.chunks.get(&coord)
    }

    pub fn is_loaded(&self, coord: ChunkCoord) -> bool {
        self.chunks.contains_key(&coord)
    }

    /// Marks an asteroid depleted, loading the chunk if needed.
    ///
    /// Returns `false` if the asteroid does not exist or was already depleted.
    pub fn deplete(&mut self, coord: ChunkCoord, asteroid_id: u32, now: u64) -> bool {
        let chunk = self.get_or_load_mut(coord, now);
        if chunk.asteroid(asteroid_id).is_none() {
            return false;
        }
        chunk.depleted.insert(asteroid_id)
    }

    /// Records `player` as present in `coord`.
    pub fn enter(&mut self, player: PlayerId, coord: ChunkCoord) {
        self.presence.entry(coord).or_default().insert(player);
    }

    /// Removes `player` from `coord`.
    pub fn leave(&mut self, player: PlayerId, coord: ChunkCoord) {
        if let Some(occupants) = self.presence.get_mut(&coord) {
            occupants.remove(&player);
            if occupants.is_empty() {
                self.presence.remove(&coord);
            }
        }
    }

    /// Players currently present in `coord`.
    pub fn occupants(&self, coord: ChunkCoord) -> Vec<PlayerId> {
        let mut players: Vec<PlayerId> = self
            .presence
            .get(&coord)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        players.sort();
        players
    }

    pub fn is_occupied(&self, coord: ChunkCoord) -> bool {
        self.presence.get(&coord).is_some_and(|set| !set.is_empty())
    }

    /// Evicts idle chunks, then enforces the ceiling.
    pub fn evict_idle(&mut self, now: u64) -> EvictionReport {
        let mut report = EvictionReport::default();
        let ttl = self.policy.ttl_ms;

        // single scan: split into expired and surviving unoccupied candidates
        let mut candidates: Vec<(u64, ChunkCoord)> = Vec::new();
        for (coord, chunk) in &self.chunks {
            if self.is_occupied(*coord) {
                continue;
            }
            if now.saturating_sub(chunk.last_access) > ttl {
                report.expired.push(*coord);
            } else {
                candidates.push((chunk.last_access, *coord));
            }
        }

        for coord in &report.expired {
            self.chunks.remove(coord);
        }

        if self.chunks.len() > self.policy.max_loaded {
            candidates.sort();
            let excess = self.chunks.len() - self.policy.max_loaded;
            for (_, coord) in candidates.into_iter().take(excess) {
                self.chunks.remove(&coord);
                report.forced.push(coord);
            }
        }

        report.expired.sort();
        self.evicted_total += report.total() as u64;
        if report.total() > 0 {
            info!(
                "🧹 Evicted {} chunks ({} idle, {} over ceiling), {} loaded",
                report.total(),
                report.expired.len(),
                report.forced.len(),
                self.chunks.len()
            );
        }
        report
    }

    /// Takes the chunk records queued since the last drain.
    pub fn drain_new_records(&mut self) -> Vec<ChunkRecord> {
        std::mem::take(&mut self.pending_records)
    }

    /// Puts records back after a failed append so the next flush retries them.
    pub fn requeue_records(&mut self, mut records: Vec<ChunkRecord>) {
        records.append(&mut self.pending_records);
        self.pending_records = records;
    }

    pub fn pending_record_count(&self) -> usize {
        self.pending_records.len()
    }

    pub fn loaded_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            loaded: self.chunks.len(),
            ceiling: self.policy.max_loaded,
            occupied: self.presence.len(),
            generated_total: self.generated_total,
            evicted_total: self.evicted_total,
        }
    }
}
