//! # Hot State Cache
//!
//! The single writer of [`PlayerState`]. Every read is served from memory;
//! durable storage only ever sees the result of a flush.
//!
//! ## Tiered Persistence
//!
//! Each mutation marks the player as pending in one of two tiers:
//!
//! - **critical**: deaths, respawns and disconnects. Flushed on the fast tick
//!   (every 250 ms by default) so these facts reach storage promptly.
//! - **batch**: movement, resource pickups, non-fatal damage. Flushed on the
//!   slow tick (every 5 s by default).
//!
//! A flush is an idempotent upsert of the *current* state of every pending
//! player. A failed flush leaves the ids pending for the next tick, so storage
//! sees every change at least once and the last write wins. Offline players
//! leave memory once nothing of theirs is pending any more.

use crate::persistence::{BattleLogEntry, DurableStore, PlayerRecord};
use crate::types::{ChunkCoord, ConnectionId, PlayerId, Position};
use crate::utils::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Health a freshly created player starts with.
pub const DEFAULT_MAX_HEALTH: u32 = 100;
/// Armor a freshly created player starts with.
pub const DEFAULT_ARMOR: u32 = 4;
/// Weapon power a freshly created player starts with.
pub const DEFAULT_WEAPON_POWER: u32 = 10;
/// Consecutive failed critical flushes before operators are alerted.
pub const DEFAULT_CRITICAL_FAILURE_ALERT: u32 = 3;

/// Errors from hot state mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Player not found: {0}")]
    PlayerNotFound(PlayerId),
    #[error("Player is offline: {0}")]
    PlayerOffline(PlayerId),
}

/// Authoritative state of one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: PlayerId,
    pub name: String,
    pub position: Position,
    pub chunk: ChunkCoord,
    pub health: u32,
    pub max_health: u32,
    pub resources: u64,
    pub armor: u32,
    pub weapon_power: u32,
    pub online: bool,
    pub in_world: bool,
    pub connection: Option<ConnectionId>,
    pub last_update: u64,
}

impl PlayerState {
    /// A brand new player at `position` with default stats.
    pub fn new(id: PlayerId, name: impl Into<String>, position: Position, chunk: ChunkCoord, now: u64) -> Self {
        Self {
            id,
            name: name.into(),
            position,
            chunk,
            health: DEFAULT_MAX_HEALTH,
            max_health: DEFAULT_MAX_HEALTH,
            resources: 0,
            armor: DEFAULT_ARMOR,
            weapon_power: DEFAULT_WEAPON_POWER,
            online: false,
            in_world: false,
            connection: None,
            last_update: now,
        }
    }

    /// Rebuilds hot state from a stored row.
    pub fn from_record(record: PlayerRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            position: Position::new(record.x, record.y),
            chunk: record.chunk,
            health: record.health,
            max_health: record.max_health,
            resources: record.resources,
            armor: record.armor,
            weapon_power: record.weapon_power,
            online: false,
            in_world: false,
            connection: None,
            last_update: record.updated_at,
        }
    }

    pub fn to_record(&self, now: u64) -> PlayerRecord {
        PlayerRecord {
            id: self.id,
            name: self.name.clone(),
            x: self.position.x,
            y: self.position.y,
            chunk: self.chunk,
            health: self.health,
            max_health: self.max_health,
            resources: self.resources,
            armor: self.armor,
            weapon_power: self.weapon_power,
            online: self.online,
            updated_at: now,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.health > 0
    }
}

/// Result of one flush pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub critical_flushed: usize,
    pub batch_flushed: usize,
    pub battle_entries_flushed: usize,
    pub evicted: Vec<PlayerId>,
    /// Players whose critical state hit the failure alert threshold this pass
    pub alerted: Vec<PlayerId>,
    pub errors: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn merge(&mut self, other: FlushReport) {
        self.critical_flushed += other.critical_flushed;
        self.batch_flushed += other.batch_flushed;
        self.battle_entries_flushed += other.battle_entries_flushed;
        self.evicted.extend(other.evicted);
        self.alerted.extend(other.alerted);
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Critical,
    Batch,
}

/// In-memory owner of all hosted players.
#[derive(Debug)]
pub struct HotStateCache {
    players: HashMap<PlayerId, PlayerState>,
    critical: HashSet<PlayerId>,
    batch: HashSet<PlayerId>,
    pending_death: HashSet<PlayerId>,
    critical_failures: HashMap<PlayerId, u32>,
    battle_log: Vec<BattleLogEntry>,
    failure_alert_threshold: u32,
}

impl Default for HotStateCache {
    fn default() -> Self {
        Self::new(DEFAULT_CRITICAL_FAILURE_ALERT)
    }
}

impl HotStateCache {
    pub fn new(failure_alert_threshold: u32) -> Self {
        Self {
            players: HashMap::new(),
            critical: HashSet::new(),
            batch: HashSet::new(),
            pending_death: HashSet::new(),
            critical_failures: HashMap::new(),
            battle_log: Vec::new(),
            failure_alert_threshold: failure_alert_threshold.max(1),
        }
    }

    pub fn get(&self, id: PlayerId) -> Option<&PlayerState> {
        self.players.get(&id)
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.players.contains_key(&id)
    }

    /// Inserts or replaces a player's entry and brings it online.
    pub fn upsert_on_connect(&mut self, id: PlayerId, mut initial: PlayerState) {
        initial.id = id;
        initial.online = true;
        initial.in_world = true;
        initial.last_update = current_timestamp_ms();
        self.players.insert(id, initial);
        self.mark(id, Tier::Batch);
    }

    /// Changes the connection that owns a hosted player.
    pub fn attach_connection(&mut self, id: PlayerId, connection: ConnectionId) -> Result<(), StateError> {
        let player = self.live_mut(id)?;
        player.connection = Some(connection);
        Ok(())
    }

    pub fn update_position(&mut self, id: PlayerId, position: Position, chunk: ChunkCoord) -> Result<(), StateError> {
        let player = self.live_mut(id)?;
        player.position = position;
        player.chunk = chunk;
        player.last_update = current_timestamp_ms();
        self.mark(id, Tier::Batch);
        Ok(())
    }

    /// Subtracts `amount` health, never going below zero.
    ///
    /// Returns the new health. A fatal hit is queued as critical.
    pub fn apply_damage(&mut self, id: PlayerId, amount: u32) -> Result<u32, StateError> {
        let player = self.live_mut(id)?;
        player.health = player.health.saturating_sub(amount);
        player.last_update = current_timestamp_ms();
        let health = player.health;

        if health == 0 {
            self.pending_death.insert(id);
            self.mark(id, Tier::Critical);
        } else {
            self.mark(id, Tier::Batch);
        }
        Ok(health)
    }

    /// Adds `amount` to the player's resource total and returns the new total.
    pub fn collect_resource(&mut self, id: PlayerId, amount: u64) -> Result<u64, StateError> {
        let player = self.live_mut(id)?;
        player.resources = player.resources.saturating_add(amount);
        player.last_update = current_timestamp_ms();
        let total = player.resources;
        self.mark(id, Tier::Batch);
        Ok(total)
    }

    /// Respawn helper: full health at a new location.
    pub fn restore(&mut self, id: PlayerId, position: Position, chunk: ChunkCoord) -> Result<(), StateError> {
        let player = self.live_mut(id)?;
        player.health = player.max_health;
        player.position = position;
        player.chunk = chunk;
        player.last_update = current_timestamp_ms();
        self.mark(id, Tier::Critical);
        Ok(())
    }

    /// Takes the player offline. The entry stays in memory until flushed.
    pub fn mark_offline(&mut self, id: PlayerId) -> Result<(), StateError> {
        let player = self
            .players
            .get_mut(&id)
            .ok_or(StateError::PlayerNotFound(id))?;
        player.online = false;
        player.in_world = false;
        player.connection = None;
        player.last_update = current_timestamp_ms();
        self.mark(id, Tier::Critical);
        Ok(())
    }

    /// Queues a battle log entry for the next critical flush.
    pub fn record_battle(&mut self, entry: BattleLogEntry) {
        self.battle_log.push(entry);
    }

    pub fn is_pending_death(&self, id: PlayerId) -> bool {
        self.pending_death.contains(&id)
    }

    /// `(critical, batch)` pending counts.
    /// Consecutive failed critical flushes for `id`; zero after a success.
    pub fn critical_failures(&self, id: PlayerId) -> u32 {
        self.critical_failures.get(&id).copied().unwrap_or(0)
    }

    /// Players currently at or past the failure alert threshold.
    pub fn alerting_count(&self) -> usize {
        self.critical_failures
            .values()
            .filter(|failures| **failures >= self.failure_alert_threshold)
            .count()
    }

    pub fn pending_counts(&self) -> (usize, usize) {
        (self.critical.len(), self.batch.len())
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.players.values().filter(|p| p.online).count()
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    /// Flushes critical entries, then batch entries.
    pub async fn flush(&mut self, store: &dyn DurableStore, now: u64) -> FlushReport {
        let mut report = self.flush_critical(store, now).await;
        let batch = self.flush_batch(store, now).await;
        report.merge(batch);
        report
    }

    /// Flushes the critical tier and the queued battle log.
    pub async fn flush_critical(&mut self, store: &dyn DurableStore, now: u64) -> FlushReport {
        let mut report = FlushReport::default();

        if !self.battle_log.is_empty() {
            let entries = std::mem::take(&mut self.battle_log);
            match store.append_battle_log(&entries).await {
                Ok(()) => report.battle_entries_flushed = entries.len(),
                Err(e) => {
                    warn!("⚠️ Battle log append failed ({} entries kept): {}", entries.len(), e);
                    report.errors.push(e.to_string());
                    let mut entries = entries;
                    entries.append(&mut self.battle_log);
                    self.battle_log = entries;
                }
            }
        }

        let ids = self.pending_ids(Tier::Critical);
        if ids.is_empty() {
            return report;
        }
        let records = self.records_for(&ids, now);

        match store.upsert_players(&records).await {
            Ok(()) => {
                for id in &ids {
                    self.critical.remove(id);
                    // the upsert carried the latest state, so the batch entry is covered too
                    self.batch.remove(id);
                    self.pending_death.remove(id);
                    self.critical_failures.remove(id);
                }
                report.critical_flushed = records.len();
                report.evicted = self.evict_flushed_offline(&ids);
                debug!("💾 Critical flush wrote {} players", records.len());
            }
            Err(e) => {
                warn!("⚠️ Critical flush failed for {} players: {}", ids.len(), e);
                for id in &ids {
                    let failures = self.critical_failures.entry(*id).or_insert(0);
                    *failures += 1;
                    if *failures % self.failure_alert_threshold == 0 {
                        report.alerted.push(*id);
                        error!(
                            player_id = %id,
                            failures = *failures,
                            "❌ Critical state for player has failed to persist {} times in a row",
                            failures
                        );
                    }
                }
                report.errors.push(e.to_string());
            }
        }
        report
    }

    /// Flushes the batch tier.
    pub async fn flush_batch(&mut self, store: &dyn DurableStore, now: u64) -> FlushReport {
        let mut report = FlushReport::default();
        let ids = self.pending_ids(Tier::Batch);
        if ids.is_empty() {
            return report;
        }
        let records = self.records_for(&ids, now);

        match store.upsert_players(&records).await {
            Ok(()) => {
                for id in &ids {
                    self.batch.remove(id);
                }
                report.batch_flushed = records.len();
                report.evicted = self.evict_flushed_offline(&ids);
                debug!("💾 Batch flush wrote {} players", records.len());
            }
            Err(e) => {
                warn!("⚠️ Batch flush failed for {} players, will retry: {}", ids.len(), e);
                report.errors.push(e.to_string());
            }
        }
        report
    }

    fn live_mut(&mut self, id: PlayerId) -> Result<&mut PlayerState, StateError> {
        let player = self
            .players
            .get_mut(&id)
            .ok_or(StateError::PlayerNotFound(id))?;
        if !player.online {
            return Err(StateError::PlayerOffline(id));
        }
        Ok(player)
    }

    fn mark(&mut self, id: PlayerId, tier: Tier) {
        match tier {
            Tier::Critical => {
                self.critical.insert(id);
            }
            Tier::Batch => {
                self.batch.insert(id);
            }
        }
    }

    /// Pending ids of a tier, dropping ids whose player has left memory.
    fn pending_ids(&mut self, tier: Tier) -> Vec<PlayerId> {
        let players = &self.players;
        let set = match tier {
            Tier::Critical => &mut self.critical,
            Tier::Batch => &mut self.batch,
        };
        set.retain(|id| players.contains_key(id));
        let mut ids: Vec<PlayerId> = set.iter().copied().collect();
        ids.sort();
        ids
    }

    fn records_for(&self, ids: &[PlayerId], now: u64) -> Vec<PlayerRecord> {
        ids.iter()
            .filter_map(|id| self.players.get(id))
            .map(|player| player.to_record(now))
            .collect()
    }

    fn evict_flushed_offline(&mut self, ids: &[PlayerId]) -> Vec<PlayerId> {
        let mut evicted = Vec::new();
        for id in ids {
            let offline = self.players.get(id).is_some_and(|p| !p.online);
            if offline && !self.critical.contains(id) && !self.batch.contains(id) {
                self.players.remove(id);
                self.critical_failures.remove(id);
                evicted.push(*id);
            }
        }
        if !evicted.is_empty() {
            debug!("🧹 Evicted {} offline players from hot state", evicted.len());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    fn online_player(cache: &mut HotStateCache, name: &str) -> PlayerId {
        let id = PlayerId::from_account_name(name);
        let state = PlayerState::new(id, name, Position::new(500.0, 500.0), ChunkCoord::ORIGIN, 0);
        cache.upsert_on_connect(id, state);
        id
    }

    #[test]
    fn test_connect_marks_online_and_batch_pending() {
        let mut cache = HotStateCache::default();
        let id = online_player(&mut cache, "vega");
        let player = cache.get(id).unwrap();
        assert!(player.online && player.in_world);
        assert_eq!(cache.pending_counts(), (0, 1));
        assert_eq!(cache.online_count(), 1);
    }

    #[test]
    fn test_damage_saturates_and_fatal_is_critical() {
        let mut cache = HotStateCache::default();
        let id = online_player(&mut cache, "vega");

        assert_eq!(cache.apply_damage(id, 30).unwrap(), 70);
        assert_eq!(cache.pending_counts(), (0, 1));
        assert_eq!(cache.apply_damage(id, 500).unwrap(), 0);
        assert!(cache.is_pending_death(id));
        assert_eq!(cache.pending_counts().0, 1);
    }

    #[test]
    fn test_unknown_and_offline_players_are_rejected() {
        let mut cache = HotStateCache::default();
        let ghost = PlayerId::new();
        assert_eq!(
            cache.apply_damage(ghost, 1),
            Err(StateError::PlayerNotFound(ghost))
        );

        let id = online_player(&mut cache, "vega");
        cache.mark_offline(id).unwrap();
        assert_eq!(
            cache.update_position(id, Position::new(1.0, 1.0), ChunkCoord::ORIGIN),
            Err(StateError::PlayerOffline(id))
        );
    }

    #[tokio::test]
    async fn test_offline_player_is_flushed_then_evicted() {
        let store = MemoryStore::new();
        let mut cache = HotStateCache::default();
        let id = online_player(&mut cache, "vega");
        cache.collect_resource(id, 25).unwrap();
        cache.mark_offline(id).unwrap();

        let report = cache.flush_critical(&store, 10).await;
        assert!(report.is_clean());
        assert_eq!(report.evicted, vec![id]);
        assert!(cache.get(id).is_none());

        let row = store.player(id).await.unwrap();
        assert!(!row.online);
        assert_eq!(row.resources, 25);
        assert_eq!(cache.pending_counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_ids_pending() {
        let store = MemoryStore::new();
        let mut cache = HotStateCache::default();
        let id = online_player(&mut cache, "vega");
        cache.apply_damage(id, 100).unwrap();

        store.set_failing(true);
        for _ in 0..3 {
            let report = cache.flush(&store, 10).await;
            assert!(!report.is_clean());
        }
        assert!(cache.is_pending_death(id));
        assert_eq!(cache.pending_counts(), (1, 1));

        store.set_failing(false);
        let report = cache.flush(&store, 20).await;
        assert!(report.is_clean());
        assert_eq!(report.critical_flushed, 1);
        assert!(!cache.is_pending_death(id));
        assert_eq!(cache.pending_counts(), (0, 0));
        assert_eq!(store.player(id).await.unwrap().health, 0);
    }

    #[tokio::test]
    async fn test_battle_log_is_retried_after_failure() {
        let store = MemoryStore::new();
        let mut cache = HotStateCache::default();
        cache.record_battle(BattleLogEntry {
            attacker: PlayerId::from_account_name("a"),
            defender: PlayerId::from_account_name("b"),
            damage: 8,
            critical: false,
            fatal: false,
            health_before: 100,
            health_after: 92,
            chunk: ChunkCoord::new(60, 0),
            timestamp: 1,
        });

        store.set_failing(true);
        cache.flush_critical(&store, 1).await;
        store.set_failing(false);
        let report = cache.flush_critical(&store, 2).await;
        assert_eq!(report.battle_entries_flushed, 1);
        assert_eq!(store.battle_log().await.len(), 1);
    }

    #[test]
    fn test_record_round_trip_keeps_stats() {
        let id = PlayerId::from_account_name("vega");
        let mut state = PlayerState::new(id, "vega", Position::new(1.5, 2.5), ChunkCoord::new(0, 0), 7);
        state.resources = 99;
        state.health = 42;
        let restored = PlayerState::from_record(state.to_record(7));
        assert_eq!(restored.resources, 99);
        assert_eq!(restored.health, 42);
        assert_eq!(restored.position, state.position);
        assert!(!restored.online);
    }

    #[tokio::test]
    async fn test_repeated_critical_failures_raise_an_alert() {
        let store = MemoryStore::new();
        let mut cache = HotStateCache::new(3);
        let id = online_player(&mut cache, "vega");
        cache.mark_offline(id).unwrap();

        store.set_failing(true);
        for attempt in 1..=2 {
            let report = cache.flush_critical(&store, 10).await;
            assert!(report.alerted.is_empty());
            assert_eq!(cache.critical_failures(id), attempt);
        }
        assert_eq!(cache.alerting_count(), 0);

        let report = cache.flush_critical(&store, 10).await;
        assert_eq!(report.alerted, vec![id]);
        assert_eq!(cache.critical_failures(id), 3);
        assert_eq!(cache.alerting_count(), 1);
        // still pending and still in memory; the player is never dropped
        assert_eq!(cache.pending_counts().0, 1);
        assert!(cache.contains(id));

        store.set_failing(false);
        let report = cache.flush_critical(&store, 20).await;
        assert!(report.is_clean());
        assert_eq!(cache.critical_failures(id), 0);
        assert_eq!(cache.alerting_count(), 0);
        assert!(!cache.contains(id));
    }
}
