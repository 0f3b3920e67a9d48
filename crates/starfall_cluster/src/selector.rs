//! # Instance Selector
//!
//! Load-aware choice of a target instance for a player.
//!
//! The pool is synchronised from the coordinator's peer view. Each entry
//! tracks success and failure counts, consecutive failures and an EWMA of
//! response times; crossing the consecutive failure threshold takes the
//! instance out of rotation until a health probe succeeds again.
//!
//! A player is routed to at most one target at a time. Asking again while an
//! assignment exists returns [`Selection::AlreadyAssigned`], as long as the
//! target is still healthy and has room; otherwise the stale assignment is
//! dropped and a new target chosen. Assignments expire after
//! `assignment_ttl` and are swept by [`InstanceSelector::prune_assignments`].

use crate::coordinator::{ClusterCoordinator, InstanceRecord};
use rand::Rng;
use serde::{Deserialize, Serialize};
use starfall_core::utils::current_timestamp_ms;
use starfall_core::{pick_weighted, PlayerId};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    /// Lowest load ratio, ties broken by lowest average response time
    LeastConnections,
    /// Probabilistic, favouring low load, fast responses and high weight
    Weighted,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::LeastConnections
    }
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub strategy: SelectionStrategy,
    pub failure_threshold: u32,
    /// Smoothing factor for the response time average
    pub response_time_alpha: f64,
    pub probe_timeout: Duration,
    /// How long a routing decision is remembered
    pub assignment_ttl: Duration,
    /// Per-instance selection weight for the weighted strategy; unlisted
    /// instances weigh 1.0
    pub weights: HashMap<String, f64>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            failure_threshold: 3,
            response_time_alpha: 0.2,
            probe_timeout: Duration::from_millis(500),
            assignment_ttl: Duration::from_secs(30),
            weights: HashMap::new(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("No healthy instance with free capacity")]
    NoAvailableInstance,
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),
}

/// Rolling health of one pool member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub healthy: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_response_ms: f64,
    pub last_checked: u64,
}

impl Default for InstanceHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_response_ms: 0.0,
            last_checked: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    record: InstanceRecord,
    weight: f64,
    health: InstanceHealth,
}

/// Outcome of [`InstanceSelector::select_for`].
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Assigned(InstanceRecord),
    AlreadyAssigned(InstanceRecord),
}

impl Selection {
    pub fn instance(&self) -> &InstanceRecord {
        match self {
            Selection::Assigned(record) | Selection::AlreadyAssigned(record) => record,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorStats {
    pub pool_size: usize,
    pub healthy: usize,
    pub assignments: usize,
}

#[derive(Debug, Clone)]
struct Assignment {
    target: String,
    assigned_at: u64,
}

/// Chooses target instances and remembers per-player assignments.
#[derive(Debug, Default)]
pub struct InstanceSelector {
    config: SelectorConfig,
    pool: BTreeMap<String, PoolEntry>,
    assignments: HashMap<PlayerId, Assignment>,
    cursor: usize,
}

impl InstanceSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            pool: BTreeMap::new(),
            assignments: HashMap::new(),
            cursor: 0,
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Replaces pool records with `peers`. Instances missing from `peers` are
    /// dropped together with their assignments; returns their ids.
    pub fn sync_pool(&mut self, peers: &[InstanceRecord]) -> Vec<String> {
        let live: HashMap<&str, &InstanceRecord> =
            peers.iter().map(|record| (record.id.as_str(), record)).collect();

        let removed: Vec<String> = self
            .pool
            .keys()
            .filter(|id| !live.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in &removed {
            self.pool.remove(id);
            info!("🗑️ Instance {} removed from selector pool", id);
        }
        if !removed.is_empty() {
            self.assignments.retain(|_, assignment| !removed.contains(&assignment.target));
        }

        for record in peers {
            match self.pool.get_mut(&record.id) {
                Some(entry) => entry.record = record.clone(),
                None => {
                    debug!("Instance {} added to selector pool", record.id);
                    let weight = self.config.weights.get(&record.id).copied().unwrap_or(1.0).max(0.0);
                    self.pool.insert(
                        record.id.clone(),
                        PoolEntry {
                            record: record.clone(),
                            weight,
                            health: InstanceHealth::default(),
                        },
                    );
                }
            }
        }
        removed
    }

    pub fn set_weight(&mut self, id: &str, weight: f64) -> Result<(), SelectorError> {
        let entry = self
            .pool
            .get_mut(id)
            .ok_or_else(|| SelectorError::UnknownInstance(id.to_string()))?;
        entry.weight = weight.max(0.0);
        Ok(())
    }

    pub fn weight(&self, id: &str) -> Option<f64> {
        self.pool.get(id).map(|entry| entry.weight)
    }

    pub fn health(&self, id: &str) -> Option<&InstanceHealth> {
        self.pool.get(id).map(|entry| &entry.health)
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.health(id).map_or(false, |health| health.healthy)
    }

    pub fn record_success(&mut self, id: &str, elapsed: Duration) {
        let alpha = self.config.response_time_alpha;
        let Some(entry) = self.pool.get_mut(id) else {
            return;
        };
        let health = &mut entry.health;
        let sample = elapsed.as_secs_f64() * 1000.0;
        health.avg_response_ms = if health.success_count == 0 {
            sample
        } else {
            alpha * sample + (1.0 - alpha) * health.avg_response_ms
        };
        health.success_count += 1;
        health.consecutive_failures = 0;
        health.last_checked = current_timestamp_ms();
        if !health.healthy {
            health.healthy = true;
            info!("💚 Instance {} is healthy again", id);
        }
    }

    pub fn record_failure(&mut self, id: &str) {
        let threshold = self.config.failure_threshold;
        let Some(entry) = self.pool.get_mut(id) else {
            return;
        };
        let health = &mut entry.health;
        health.failure_count += 1;
        health.consecutive_failures += 1;
        health.last_checked = current_timestamp_ms();
        if health.healthy && health.consecutive_failures >= threshold {
            health.healthy = false;
            warn!(
                "💔 Instance {} marked unhealthy after {} consecutive failures",
                id, health.consecutive_failures
            );
        }
    }

    fn candidates(&self) -> Vec<&PoolEntry> {
        self.pool
            .values()
            .filter(|entry| entry.health.healthy && entry.record.has_capacity())
            .collect()
    }

    /// Picks an instance using the configured strategy.
    pub fn select<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<InstanceRecord> {
        let strategy = self.config.strategy;
        let candidates = self.candidates();
        if candidates.is_empty() {
            return None;
        }

        let chosen = match strategy {
            SelectionStrategy::RoundRobin => {
                let index = self.cursor % candidates.len();
                candidates[index]
            }
            SelectionStrategy::LeastConnections => candidates.iter().copied().min_by(|a, b| {
                a.record
                    .load_ratio()
                    .total_cmp(&b.record.load_ratio())
                    .then(a.health.avg_response_ms.total_cmp(&b.health.avg_response_ms))
            })?,
            SelectionStrategy::Weighted => {
                let scores: Vec<f64> = candidates.iter().map(|entry| weighted_score(entry)).collect();
                candidates[pick_weighted(rng, &scores)?]
            }
        };
        let record = chosen.record.clone();
        if strategy == SelectionStrategy::RoundRobin {
            self.cursor = self.cursor.wrapping_add(1);
        }
        Some(record)
    }

    /// Routes `player`, reusing an existing assignment when one is held.
    pub fn select_for(&mut self, player: PlayerId) -> Result<Selection, SelectorError> {
        self.select_for_with(player, &mut rand::thread_rng())
    }

    pub fn select_for_with<R: Rng + ?Sized>(
        &mut self,
        player: PlayerId,
        rng: &mut R,
    ) -> Result<Selection, SelectorError> {
        let now = current_timestamp_ms();
        let ttl_ms = self.config.assignment_ttl.as_millis() as u64;
        if let Some(assignment) = self.assignments.get(&player) {
            let usable = self
                .pool
                .get(&assignment.target)
                .filter(|entry| entry.health.healthy && entry.record.has_capacity())
                .filter(|_| now.saturating_sub(assignment.assigned_at) <= ttl_ms);
            if let Some(entry) = usable {
                return Ok(Selection::AlreadyAssigned(entry.record.clone()));
            }
            debug!("Dropping stale assignment of player {} to {}", player, assignment.target);
            self.assignments.remove(&player);
        }
        let record = self.select(rng).ok_or(SelectorError::NoAvailableInstance)?;
        self.assignments.insert(
            player,
            Assignment {
                target: record.id.clone(),
                assigned_at: now,
            },
        );
        Ok(Selection::Assigned(record))
    }

    /// Frees `player`'s assignment. Returns the instance it pointed to.
    pub fn release(&mut self, player: PlayerId) -> Option<String> {
        self.assignments.remove(&player).map(|assignment| assignment.target)
    }

    pub fn assignment(&self, player: PlayerId) -> Option<&str> {
        self.assignments.get(&player).map(|assignment| assignment.target.as_str())
    }

    /// Drops assignments older than the assignment TTL. Returns how many.
    pub fn prune_assignments(&mut self, now: u64) -> usize {
        let ttl_ms = self.config.assignment_ttl.as_millis() as u64;
        let before = self.assignments.len();
        self.assignments
            .retain(|_, assignment| now.saturating_sub(assignment.assigned_at) <= ttl_ms);
        before - self.assignments.len()
    }

    /// Ids worth probing: everything in the pool.
    pub fn probe_targets(&self) -> Vec<String> {
        self.pool.keys().cloned().collect()
    }

    pub fn stats(&self) -> SelectorStats {
        SelectorStats {
            pool_size: self.pool.len(),
            healthy: self.pool.values().filter(|entry| entry.health.healthy).count(),
            assignments: self.assignments.len(),
        }
    }
}

fn weighted_score(entry: &PoolEntry) -> f64 {
    let headroom = (1.0 - entry.record.load_ratio()).max(0.0);
    let latency_penalty = 1.0 + entry.health.avg_response_ms / 100.0;
    entry.weight * headroom / latency_penalty
}

/// Checks that `id` still has a live record on the fabric.
///
/// Returns the round-trip time on success.
pub async fn probe_instance(
    coordinator: &ClusterCoordinator,
    id: &str,
    timeout: Duration,
) -> Option<Duration> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, coordinator.fetch_record(id)).await {
        Ok(Some(_)) => Some(started.elapsed()),
        Ok(None) => {
            debug!("Health probe: no live record for instance {}", id);
            None
        }
        Err(_) => {
            debug!("Health probe for instance {} timed out", id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ResourceSnapshot;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn record(id: &str, player_count: usize, capacity: usize) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            address: format!("ws://{id}:8080"),
            player_count,
            capacity,
            utilization: ResourceSnapshot::default(),
            started_at: 0,
            uptime_secs: 0,
            last_heartbeat: 0,
        }
    }

    fn selector(strategy: SelectionStrategy, pool: &[InstanceRecord]) -> InstanceSelector {
        let mut selector = InstanceSelector::new(SelectorConfig {
            strategy,
            ..SelectorConfig::default()
        });
        selector.sync_pool(pool);
        selector
    }

    #[test]
    fn test_round_robin_cycles() {
        let mut s = selector(
            SelectionStrategy::RoundRobin,
            &[record("a", 0, 10), record("b", 0, 10)],
        );
        let mut rng = StdRng::seed_from_u64(1);
        let picks: Vec<String> = (0..4).map(|_| s.select(&mut rng).unwrap().id).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_least_connections_prefers_low_load_then_fast() {
        let mut s = selector(
            SelectionStrategy::LeastConnections,
            &[record("a", 5, 10), record("b", 2, 10), record("c", 2, 10)],
        );
        s.record_success("b", Duration::from_millis(80));
        s.record_success("c", Duration::from_millis(20));
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(s.select(&mut rng).unwrap().id, "c");
    }

    #[test]
    fn test_weighted_never_picks_full_or_zero_weight() {
        let mut s = selector(
            SelectionStrategy::Weighted,
            &[record("full", 10, 10), record("idle", 0, 10), record("muted", 0, 10)],
        );
        s.set_weight("muted", 0.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            assert_eq!(s.select(&mut rng).unwrap().id, "idle");
        }
        assert!(s.set_weight("ghost", 1.0).is_err());
    }

    #[test]
    fn test_consecutive_failures_mark_unhealthy_until_success() {
        let mut s = selector(SelectionStrategy::RoundRobin, &[record("a", 0, 10)]);
        s.record_failure("a");
        s.record_failure("a");
        assert!(s.is_healthy("a"));
        s.record_failure("a");
        assert!(!s.is_healthy("a"));

        let mut rng = StdRng::seed_from_u64(1);
        assert!(s.select(&mut rng).is_none());

        s.record_success("a", Duration::from_millis(5));
        assert!(s.is_healthy("a"));
        assert_eq!(s.health("a").unwrap().consecutive_failures, 0);
        assert!(s.select(&mut rng).is_some());
    }

    #[test]
    fn test_player_is_assigned_once_until_released() {
        let mut s = selector(
            SelectionStrategy::RoundRobin,
            &[record("a", 0, 10), record("b", 0, 10)],
        );
        let player = PlayerId::new();
        let first = s.select_for(player).unwrap();
        assert!(matches!(first, Selection::Assigned(_)));
        let second = s.select_for(player).unwrap();
        assert_eq!(second, Selection::AlreadyAssigned(first.instance().clone()));

        assert_eq!(s.release(player).as_deref(), Some(first.instance().id.as_str()));
        assert!(matches!(s.select_for(player).unwrap(), Selection::Assigned(_)));
    }

    #[test]
    fn test_sync_drops_dead_instances_and_their_assignments() {
        let mut s = selector(SelectionStrategy::RoundRobin, &[record("a", 0, 10)]);
        let player = PlayerId::new();
        s.select_for(player).unwrap();

        let removed = s.sync_pool(&[record("b", 0, 10)]);
        assert_eq!(removed, vec!["a".to_string()]);
        assert_eq!(s.assignment(player), None);
        assert_eq!(s.stats(), SelectorStats { pool_size: 1, healthy: 1, assignments: 0 });
    }

    #[test]
    fn test_empty_pool_has_no_selection() {
        let mut s = InstanceSelector::default();
        assert_eq!(s.select_for(PlayerId::new()), Err(SelectorError::NoAvailableInstance));
    }

    #[test]
    fn test_unhealthy_target_loses_its_assignments() {
        let mut s = selector(
            SelectionStrategy::RoundRobin,
            &[record("a", 0, 10), record("b", 0, 10)],
        );
        let mut rng = StdRng::seed_from_u64(1);
        let player = PlayerId::new();
        let first = s.select_for_with(player, &mut rng).unwrap();
        assert_eq!(first.instance().id, "a");

        for _ in 0..3 {
            s.record_failure("a");
        }
        assert!(!s.is_healthy("a"));

        let second = s.select_for_with(player, &mut rng).unwrap();
        assert_eq!(second, Selection::Assigned(record("b", 0, 10)));
        assert_eq!(s.assignment(player), Some("b"));
    }

    #[test]
    fn test_full_target_loses_its_assignments() {
        let mut s = selector(SelectionStrategy::LeastConnections, &[record("a", 0, 10)]);
        let player = PlayerId::new();
        s.select_for(player).unwrap();

        s.sync_pool(&[record("a", 10, 10), record("b", 3, 10)]);
        let again = s.select_for(player).unwrap();
        assert!(matches!(again, Selection::Assigned(ref target) if target.id == "b"));
    }

    #[test]
    fn test_assignments_expire() {
        let mut s = InstanceSelector::new(SelectorConfig {
            strategy: SelectionStrategy::RoundRobin,
            assignment_ttl: Duration::from_secs(30),
            ..SelectorConfig::default()
        });
        s.sync_pool(&[record("a", 0, 10)]);
        let player = PlayerId::new();
        s.select_for(player).unwrap();

        let now = current_timestamp_ms();
        assert_eq!(s.prune_assignments(now), 0);
        assert_eq!(s.stats().assignments, 1);
        assert_eq!(s.prune_assignments(now + 30_001), 1);
        assert_eq!(s.assignment(player), None);
    }

    #[test]
    fn test_configured_weights_apply_to_new_pool_members() {
        let mut weights = HashMap::new();
        weights.insert("heavy".to_string(), 4.0);
        weights.insert("off".to_string(), 0.0);
        let mut s = InstanceSelector::new(SelectorConfig {
            strategy: SelectionStrategy::Weighted,
            weights,
            ..SelectorConfig::default()
        });
        s.sync_pool(&[record("heavy", 0, 10), record("off", 0, 10), record("plain", 0, 10)]);

        assert_eq!(s.weight("heavy"), Some(4.0));
        assert_eq!(s.weight("off"), Some(0.0));
        assert_eq!(s.weight("plain"), Some(1.0));

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            assert_ne!(s.select(&mut rng).unwrap().id, "off");
        }
    }
}
