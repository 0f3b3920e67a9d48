//! # Cluster Coordinator
//!
//! Membership, liveness and leader election across game server instances.
//!
//! Each instance publishes an [`InstanceRecord`] under `cluster:instance:{id}`
//! with a short TTL and refreshes it on every heartbeat. Heartbeats are also
//! broadcast on `cluster:events`, which every coordinator listens to in order
//! to maintain its peer view. Peers that stay silent longer than the peer
//! timeout are presumed dead.
//!
//! ## Leader Election
//!
//! Every known instance, self included, is ranked by uptime ascending, then
//! player count ascending, then instance id; the first one leads. Uptime is
//! compared through `started_at` (latest start first) rather than the
//! `uptime_secs` snapshot in each record, so records heard at different times
//! still rank the same way on every instance. Election is local and
//! non-consensus, so a network partition can briefly yield two leaders.

use crate::fabric::Fabric;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use starfall_core::utils::current_timestamp_ms;
use starfall_core::ShutdownState;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const EVENTS_CHANNEL: &str = "cluster:events";

pub fn instance_key(id: &str) -> String {
    format!("cluster:instance:{id}")
}

pub fn stats_key(id: &str) -> String {
    format!("cluster:stats:{id}")
}

/// Host resource utilization at heartbeat time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_used: u64,
    pub memory_total: u64,
}

/// Liveness and load record published by each instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub address: String,
    pub player_count: usize,
    pub capacity: usize,
    pub utilization: ResourceSnapshot,
    pub started_at: u64,
    pub uptime_secs: u64,
    pub last_heartbeat: u64,
}

impl InstanceRecord {
    /// Fraction of capacity in use. Zero-capacity instances count as full.
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            self.player_count as f64 / self.capacity as f64
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.player_count < self.capacity
    }
}

/// Messages exchanged on [`EVENTS_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    Heartbeat { record: InstanceRecord },
    LeaderElected { leader: String, elected_by: String },
    Leaving { id: String },
}

/// Ranking used for election: uptime, then player count, then id.
fn election_order(a: &InstanceRecord, b: &InstanceRecord) -> CmpOrdering {
    b.started_at
        .cmp(&a.started_at)
        .then(a.player_count.cmp(&b.player_count))
        .then_with(|| a.id.cmp(&b.id))
}

/// Picks the leader among `candidates`.
pub fn elect_leader(candidates: &[InstanceRecord]) -> Option<&InstanceRecord> {
    candidates.iter().min_by(|a, b| election_order(a, b))
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    /// Address clients use to reach this instance
    pub address: String,
    pub capacity: usize,
    pub record_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub peer_timeout: Duration,
    pub election_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            address: "ws://127.0.0.1:8080".to_string(),
            capacity: 1000,
            record_ttl: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(15),
            election_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    record: InstanceRecord,
    last_seen: u64,
}

/// Result of one prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub leader_lost: bool,
}

/// Cluster membership for one instance.
pub struct ClusterCoordinator {
    fabric: Fabric,
    config: CoordinatorConfig,
    started_at: u64,
    player_count: AtomicUsize,
    peers: DashMap<String, PeerEntry>,
    leader: RwLock<Option<String>>,
    system: Mutex<System>,
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("instance_id", &self.config.instance_id)
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl ClusterCoordinator {
    pub fn new(fabric: Fabric, config: CoordinatorConfig) -> Self {
        Self::with_start_time(fabric, config, current_timestamp_ms())
    }

    pub fn with_start_time(fabric: Fabric, config: CoordinatorConfig, started_at: u64) -> Self {
        Self {
            fabric,
            config,
            started_at,
            player_count: AtomicUsize::new(0),
            peers: DashMap::new(),
            leader: RwLock::new(None),
            system: Mutex::new(System::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn set_player_count(&self, count: usize) {
        self.player_count.store(count, Ordering::Relaxed);
    }

    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    async fn utilization(&self) -> ResourceSnapshot {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        system.refresh_cpu_usage();
        ResourceSnapshot {
            cpu_percent: system.global_cpu_usage(),
            memory_used: system.used_memory(),
            memory_total: system.total_memory(),
        }
    }

    /// This instance's record as of `now`.
    pub async fn local_record(&self, now: u64) -> InstanceRecord {
        InstanceRecord {
            id: self.config.instance_id.clone(),
            address: self.config.address.clone(),
            player_count: self.player_count(),
            capacity: self.config.capacity,
            utilization: self.utilization().await,
            started_at: self.started_at,
            uptime_secs: now.saturating_sub(self.started_at) / 1000,
            last_heartbeat: now,
        }
    }

    /// Registers with the cluster and starts listening for cluster events.
    pub async fn start(self: &Arc<Self>, shutdown: ShutdownState) -> JoinHandle<()> {
        let events = self.fabric.subscribe(EVENTS_CHANNEL).await;
        self.heartbeat().await;
        self.elect().await;
        info!(
            "🌐 Cluster coordinator started for instance {} ({:?} fabric)",
            self.config.instance_id,
            self.fabric.mode()
        );

        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.listen(events, shutdown).await })
    }

    async fn listen(&self, mut events: broadcast::Receiver<String>, shutdown: ShutdownState) {
        loop {
            tokio::select! {
                message = events.recv() => match message {
                    Ok(raw) => match serde_json::from_str::<ClusterEvent>(&raw) {
                        Ok(event) => self.apply_event(event, current_timestamp_ms()).await,
                        Err(e) => debug!("Ignoring malformed cluster event: {}", e),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("⚠️ Cluster event listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        debug!("Cluster event listener stopped");
    }

    /// Applies one event from the cluster channel.
    pub async fn apply_event(&self, event: ClusterEvent, now: u64) {
        match event {
            ClusterEvent::Heartbeat { record } => {
                if record.id == self.config.instance_id {
                    return;
                }
                if !self.peers.contains_key(&record.id) {
                    info!("🤝 Peer instance {} joined at {}", record.id, record.address);
                }
                self.peers.insert(
                    record.id.clone(),
                    PeerEntry {
                        record,
                        last_seen: now,
                    },
                );
            }
            ClusterEvent::LeaderElected { leader, elected_by } => {
                if elected_by == self.config.instance_id {
                    return;
                }
                let known = leader == self.config.instance_id || self.peers.contains_key(&leader);
                let mut current = self.leader.write().await;
                if known && current.as_deref() != Some(leader.as_str()) {
                    debug!("Adopting leader {} announced by {}", leader, elected_by);
                    *current = Some(leader);
                }
            }
            ClusterEvent::Leaving { id } => {
                if self.peers.remove(&id).is_some() {
                    info!("👋 Peer instance {} left the cluster", id);
                    if self.leader().await.as_deref() == Some(id.as_str()) {
                        self.elect().await;
                    }
                }
            }
        }
    }

    /// Refreshes this instance's record and announces it.
    pub async fn heartbeat(&self) {
        let record = self.local_record(current_timestamp_ms()).await;
        let key = instance_key(&record.id);
        if let Err(e) = self.fabric.set_json(&key, &record, self.config.record_ttl).await {
            warn!("⚠️ Failed to encode instance record: {}", e);
            return;
        }
        let event = ClusterEvent::Heartbeat { record };
        if let Err(e) = self.fabric.publish_json(EVENTS_CHANNEL, &event).await {
            warn!("⚠️ Failed to encode heartbeat: {}", e);
        }
    }

    /// Drops peers silent for longer than the peer timeout. Re-elects
    /// straight away if the leader was among them.
    pub async fn prune_peers(&self, now: u64) -> PruneReport {
        let timeout_ms = self.config.peer_timeout.as_millis() as u64;
        let mut removed = Vec::new();
        self.peers.retain(|id, entry| {
            let alive = now.saturating_sub(entry.last_seen) <= timeout_ms;
            if !alive {
                removed.push(id.clone());
            }
            alive
        });

        let mut report = PruneReport::default();
        if removed.is_empty() {
            return report;
        }
        for id in &removed {
            warn!("💀 Peer instance {} missed heartbeats, presumed dead", id);
        }
        let leader = self.leader().await;
        report.leader_lost = leader.map_or(false, |l| removed.contains(&l));
        report.removed = removed;
        if report.leader_lost {
            self.elect().await;
        }
        report
    }

    /// Runs an election over the current view and announces a changed result.
    pub async fn elect(&self) -> Option<String> {
        let mut candidates = self.peers();
        candidates.push(self.local_record(current_timestamp_ms()).await);

        let winner = elect_leader(&candidates)?.id.clone();
        let changed = {
            let mut leader = self.leader.write().await;
            let changed = leader.as_deref() != Some(winner.as_str());
            *leader = Some(winner.clone());
            changed
        };

        if changed {
            if winner == self.config.instance_id {
                info!("👑 This instance ({}) is now cluster leader", winner);
            } else {
                info!("👑 Instance {} elected cluster leader", winner);
            }
            let event = ClusterEvent::LeaderElected {
                leader: winner.clone(),
                elected_by: self.config.instance_id.clone(),
            };
            if let Err(e) = self.fabric.publish_json(EVENTS_CHANNEL, &event).await {
                warn!("⚠️ Failed to encode election result: {}", e);
            }
        }
        Some(winner)
    }

    /// Removes this instance from the cluster.
    pub async fn deregister(&self) {
        self.fabric.delete(&instance_key(&self.config.instance_id)).await;
        let event = ClusterEvent::Leaving {
            id: self.config.instance_id.clone(),
        };
        if let Err(e) = self.fabric.publish_json(EVENTS_CHANNEL, &event).await {
            warn!("⚠️ Failed to encode leave event: {}", e);
        }
        info!("👋 Instance {} deregistered from cluster", self.config.instance_id);
    }

    /// Publishes an operational stats snapshot for external monitoring.
    pub async fn publish_stats<T: Serialize>(&self, stats: &T) {
        let key = stats_key(&self.config.instance_id);
        if let Err(e) = self.fabric.set_json(&key, stats, self.config.record_ttl).await {
            warn!("⚠️ Failed to encode stats snapshot: {}", e);
        }
    }

    /// Reads a peer's current record from the fabric.
    pub async fn fetch_record(&self, id: &str) -> Option<InstanceRecord> {
        self.fabric.get_json(&instance_key(id)).await
    }

    /// Known live peers, excluding self, sorted by id.
    pub fn peers(&self) -> Vec<InstanceRecord> {
        let mut peers: Vec<InstanceRecord> =
            self.peers.iter().map(|entry| entry.record.clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn peer(&self, id: &str) -> Option<InstanceRecord> {
        self.peers.get(id).map(|entry| entry.record.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub async fn leader(&self) -> Option<String> {
        self.leader.read().await.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.leader().await.as_deref() == Some(self.config.instance_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{FabricBackend, FabricConfig, MemoryBackend};

    const NOW: u64 = 10_000_000;

    fn record(id: &str, uptime_secs: u64, player_count: usize) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            address: format!("ws://{id}:8080"),
            player_count,
            capacity: 100,
            utilization: ResourceSnapshot::default(),
            started_at: NOW - uptime_secs * 1000,
            uptime_secs,
            last_heartbeat: NOW,
        }
    }

    fn coordinator(fabric: Fabric, id: &str, started_at: u64) -> ClusterCoordinator {
        let config = CoordinatorConfig {
            instance_id: id.to_string(),
            ..CoordinatorConfig::default()
        };
        ClusterCoordinator::with_start_time(fabric, config, started_at)
    }

    #[test]
    fn test_election_ranks_uptime_then_load_then_id() {
        let candidates = vec![record("a", 10, 2), record("b", 5, 1), record("c", 5, 3)];
        assert_eq!(elect_leader(&candidates).unwrap().id, "b");

        let tied = vec![record("z", 5, 1), record("m", 5, 1)];
        assert_eq!(elect_leader(&tied).unwrap().id, "m");
        assert!(elect_leader(&[]).is_none());
    }

    #[test]
    fn test_load_ratio() {
        let mut r = record("a", 0, 25);
        assert!((r.load_ratio() - 0.25).abs() < f64::EPSILON);
        assert!(r.has_capacity());
        r.capacity = 0;
        assert_eq!(r.load_ratio(), 1.0);
    }

    #[tokio::test]
    async fn test_heartbeats_build_peer_view_and_pruning_reelects() {
        let fabric = Fabric::local(FabricConfig::default());
        let now = current_timestamp_ms();
        // self has been up for an hour, so a fresh peer outranks it
        let local = coordinator(fabric, "self", now.saturating_sub(3_600_000));

        let young = InstanceRecord {
            started_at: now - 1_000,
            ..record("young", 1, 0)
        };
        local.apply_event(ClusterEvent::Heartbeat { record: young }, now).await;
        assert_eq!(local.peer_count(), 1);
        assert_eq!(local.elect().await.as_deref(), Some("young"));
        assert!(!local.is_leader().await);

        let report = local.prune_peers(now + 15_001).await;
        assert_eq!(report.removed, vec!["young".to_string()]);
        assert!(report.leader_lost);
        assert!(local.is_leader().await);
    }

    #[tokio::test]
    async fn test_stale_heartbeats_still_agree_on_the_leader() {
        let now = current_timestamp_ms();
        let a = coordinator(Fabric::local(FabricConfig::default()), "a", now - 10_000);
        let b = coordinator(Fabric::local(FabricConfig::default()), "b", now - 8_000);

        // each side last heard the other four seconds ago
        let a_seen_by_b = a.local_record(now - 4_000).await;
        let b_seen_by_a = b.local_record(now - 4_000).await;
        assert!(a_seen_by_b.uptime_secs < b.local_record(now).await.uptime_secs);

        a.apply_event(ClusterEvent::Heartbeat { record: b_seen_by_a }, now).await;
        b.apply_event(ClusterEvent::Heartbeat { record: a_seen_by_b }, now).await;

        let leader_a = a.elect().await;
        let leader_b = b.elect().await;
        assert_eq!(leader_a, leader_b);
        assert_eq!(leader_a.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_own_heartbeat_is_not_a_peer() {
        let fabric = Fabric::local(FabricConfig::default());
        let local = coordinator(fabric, "self", 0);
        let mine = local.local_record(1_000).await;
        local.apply_event(ClusterEvent::Heartbeat { record: mine }, 1_000).await;
        assert_eq!(local.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_two_instances_discover_each_other_and_deregister() {
        let shared: Arc<dyn FabricBackend> = Arc::new(MemoryBackend::default());
        let a = Arc::new(coordinator(
            Fabric::with_backend(Arc::clone(&shared), FabricConfig::default()),
            "a",
            current_timestamp_ms(),
        ));
        let b = Arc::new(coordinator(
            Fabric::with_backend(shared, FabricConfig::default()),
            "b",
            current_timestamp_ms(),
        ));
        let shutdown = ShutdownState::new();
        let _la = a.start(shutdown.clone()).await;
        let _lb = b.start(shutdown.clone()).await;

        a.heartbeat().await;
        b.heartbeat().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.peers().iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(b.peer_count(), 1);
        assert!(b.fetch_record("a").await.is_some());

        b.deregister().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.peer_count(), 0);
        assert!(a.fetch_record("b").await.is_none());
        shutdown.initiate_shutdown();
    }
}
