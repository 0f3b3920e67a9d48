//! # World Runtime
//!
//! The single task that owns the [`World`]. Connection tasks and timers talk
//! to it through [`WorldHandle`], which wraps the command channel; commands
//! are handled to completion in arrival order.
//!
//! The loop suspends only for I/O: the authenticator, host claims and store
//! loads during authentication, durable store flushes, heartbeats and health
//! probes. Everything else is synchronous.
//!
//! ## Periodic Tasks
//!
//! Each periodic responsibility is its own task that posts a [`Tick`] into
//! the loop at a fixed interval (see [`spawn_periodic_tasks`]). A tick that
//! finds the command queue full is skipped rather than queued behind it.

use crate::config::{ServerConfig, TaskIntervals};
use crate::error::ServerError;
use crate::stats::StatsSnapshot;
use crate::world::{Dispatch, World};
use rand::rngs::StdRng;
use rand::SeedableRng;
use starfall_cluster::{
    probe_instance, ClaimOutcome, ClusterCoordinator, InstanceSelector, PlayerDirectory,
};
use starfall_core::{
    current_timestamp_ms, Authenticator, ConnectionId, DurableStore, FlushReport, InboundEvent,
    OutboundEvent, PlayerId, RateEvent, ShutdownState,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// What the transport writes to one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(OutboundEvent),
    /// Send a close frame and stop writing
    Close(String),
}

/// Periodic work the world loop performs on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tick {
    CriticalFlush,
    BatchFlush,
    ChunkEviction,
    PruneSweep,
    Heartbeat,
    Election,
    HealthProbe,
    StatsMonitor,
}

impl Tick {
    pub fn name(&self) -> &'static str {
        match self {
            Tick::CriticalFlush => "critical_flush",
            Tick::BatchFlush => "batch_flush",
            Tick::ChunkEviction => "chunk_eviction",
            Tick::PruneSweep => "prune_sweep",
            Tick::Heartbeat => "heartbeat",
            Tick::Election => "election",
            Tick::HealthProbe => "health_probe",
            Tick::StatsMonitor => "stats_monitor",
        }
    }
}

#[derive(Debug)]
pub enum WorldCommand {
    Connect {
        conn: ConnectionId,
        ip: IpAddr,
        outbound: mpsc::Sender<Outbound>,
    },
    Inbound {
        conn: ConnectionId,
        event: InboundEvent,
    },
    /// A frame that failed to parse
    Malformed {
        conn: ConnectionId,
        error: String,
    },
    Disconnect {
        conn: ConnectionId,
    },
    Stats {
        reply: oneshot::Sender<StatsSnapshot>,
    },
    Tick(Tick),
    /// Flush everything and stop the loop
    Shutdown {
        done: oneshot::Sender<FlushReport>,
    },
}

/// Collaborators the world loop calls out to.
#[derive(Clone)]
pub struct RuntimeServices {
    pub store: Arc<dyn DurableStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub coordinator: Arc<ClusterCoordinator>,
    pub directory: PlayerDirectory,
}

/// Cloneable handle to the world loop.
#[derive(Debug, Clone)]
pub struct WorldHandle {
    commands: mpsc::Sender<WorldCommand>,
    next_connection: Arc<AtomicU64>,
    outbound_queue: usize,
}

impl WorldHandle {
    async fn command(&self, command: WorldCommand) -> Result<(), ServerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServerError::Internal("world loop has stopped".to_string()))
    }

    /// Registers a new connection and returns its outbound queue.
    pub async fn connect(&self, ip: IpAddr) -> Result<(ConnectionId, mpsc::Receiver<Outbound>), ServerError> {
        let conn = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (outbound, receiver) = mpsc::channel(self.outbound_queue);
        self.command(WorldCommand::Connect { conn, ip, outbound }).await?;
        Ok((conn, receiver))
    }

    pub async fn send(&self, conn: ConnectionId, event: InboundEvent) -> Result<(), ServerError> {
        self.command(WorldCommand::Inbound { conn, event }).await
    }

    pub async fn malformed(&self, conn: ConnectionId, error: impl Into<String>) -> Result<(), ServerError> {
        self.command(WorldCommand::Malformed {
            conn,
            error: error.into(),
        })
        .await
    }

    pub async fn disconnect(&self, conn: ConnectionId) -> Result<(), ServerError> {
        self.command(WorldCommand::Disconnect { conn }).await
    }

    pub async fn stats(&self) -> Result<StatsSnapshot, ServerError> {
        let (reply, response) = oneshot::channel();
        self.command(WorldCommand::Stats { reply }).await?;
        response
            .await
            .map_err(|_| ServerError::Internal("world loop dropped stats request".to_string()))
    }

    /// Posts a tick without waiting. A full queue skips the tick; returns
    /// false once the world loop is gone.
    pub fn tick(&self, tick: Tick) -> bool {
        match self.commands.try_send(WorldCommand::Tick(tick)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("⏭️ World loop busy, skipping {} tick", tick.name());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Runs the final flush and stops the loop.
    pub async fn shutdown(&self) -> Result<FlushReport, ServerError> {
        let (done, flushed) = oneshot::channel();
        self.command(WorldCommand::Shutdown { done }).await?;
        flushed
            .await
            .map_err(|_| ServerError::Internal("world loop stopped before flushing".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Starts the world loop. The loop runs until [`WorldHandle::shutdown`] is
/// called or every handle is dropped; both paths flush pending state.
pub fn spawn_world(config: &ServerConfig, services: RuntimeServices) -> (WorldHandle, JoinHandle<()>) {
    let (commands, receiver) = mpsc::channel(config.command_queue);
    let world = World::new(
        config.world.clone(),
        config.rate_limits.clone(),
        config.persistence.critical_failure_alert,
    );
    let runtime = WorldRuntime {
        world,
        selector: InstanceSelector::new(config.cluster.selector.clone()),
        connections: HashMap::new(),
        max_connections: config.max_connections,
        store_timeout: config.persistence.store_timeout,
        rng: StdRng::from_entropy(),
        services,
    };
    let handle = WorldHandle {
        commands,
        next_connection: Arc::new(AtomicU64::new(1)),
        outbound_queue: config.outbound_queue,
    };
    (handle, tokio::spawn(runtime.run(receiver)))
}

/// Spawns one ticker per periodic responsibility. Each stops on shutdown or
/// when the world loop is gone.
pub fn spawn_periodic_tasks(
    handle: &WorldHandle,
    tasks: &TaskIntervals,
    heartbeat: Duration,
    election: Duration,
    shutdown: &ShutdownState,
) -> Vec<JoinHandle<()>> {
    let schedule = [
        (Tick::CriticalFlush, tasks.critical_flush),
        (Tick::BatchFlush, tasks.batch_flush),
        (Tick::ChunkEviction, tasks.chunk_eviction),
        (Tick::PruneSweep, tasks.prune_sweep),
        (Tick::Heartbeat, heartbeat),
        (Tick::Election, election),
        (Tick::HealthProbe, tasks.health_probe),
        (Tick::StatsMonitor, tasks.stats_monitor),
    ];
    schedule
        .into_iter()
        .map(|(tick, period)| {
            let handle = handle.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // the first tick of an interval fires immediately
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !handle.tick(tick) {
                                break;
                            }
                        }
                        _ = shutdown.wait() => break,
                    }
                }
                trace!("🕒 {} task stopped", tick.name());
            })
        })
        .collect()
}

struct WorldRuntime {
    world: World,
    selector: InstanceSelector,
    connections: HashMap<ConnectionId, mpsc::Sender<Outbound>>,
    max_connections: usize,
    store_timeout: Duration,
    rng: StdRng,
    services: RuntimeServices,
}

impl WorldRuntime {
    async fn run(mut self, mut commands: mpsc::Receiver<WorldCommand>) {
        info!("🌍 World loop started");
        while let Some(command) = commands.recv().await {
            if let WorldCommand::Shutdown { done } = command {
                let report = self.final_flush().await;
                let _ = done.send(report);
                info!("🌍 World loop stopped");
                return;
            }
            self.handle_command(command).await;
        }
        self.final_flush().await;
        info!("🌍 World loop stopped (all handles dropped)");
    }

    async fn handle_command(&mut self, command: WorldCommand) {
        let now = current_timestamp_ms();
        match command {
            WorldCommand::Connect { conn, ip, outbound } => {
                if self.connections.len() >= self.max_connections {
                    warn!("🚫 Connection limit {} reached, refusing {}", self.max_connections, ip);
                    let _ = outbound.try_send(Outbound::Close("server at capacity".to_string()));
                    return;
                }
                self.world.connect(conn, ip);
                self.connections.insert(conn, outbound);
            }
            WorldCommand::Inbound { conn, event } => self.handle_inbound(conn, event, now).await,
            WorldCommand::Malformed { conn, error } => {
                debug!("Malformed frame from {}: {}", conn, error);
                self.deliver(vec![Dispatch::send(conn, OutboundEvent::rejected("parse", error))]);
            }
            WorldCommand::Disconnect { conn } => self.handle_disconnect(conn, now).await,
            WorldCommand::Stats { reply } => {
                let _ = reply.send(self.snapshot(now).await);
            }
            WorldCommand::Tick(tick) => self.handle_tick(tick, now).await,
            WorldCommand::Shutdown { .. } => {}
        }
    }

    async fn handle_inbound(&mut self, conn: ConnectionId, event: InboundEvent, now: u64) {
        match event {
            InboundEvent::Authenticate { token } => self.authenticate(conn, &token, now).await,
            InboundEvent::Stats => {
                if let Err(limited) = self.world.check_rate(conn, RateEvent::Stats, now) {
                    self.deliver(limited);
                    return;
                }
                let snapshot = self.snapshot(now).await;
                match serde_json::to_value(&snapshot) {
                    Ok(stats) => self.deliver(vec![Dispatch::send(conn, OutboundEvent::Stats { stats })]),
                    Err(e) => error!("❌ Failed to encode stats snapshot: {}", e),
                }
            }
            InboundEvent::Disconnect { reason } => {
                debug!("🔌 Client {} disconnecting: {}", conn, reason.as_deref().unwrap_or("no reason"));
                self.deliver(vec![Dispatch::Close {
                    to: conn,
                    reason: "goodbye".to_string(),
                }]);
                self.handle_disconnect(conn, now).await;
            }
            event => {
                let dispatches = self.world.handle(conn, event, now);
                self.deliver(dispatches);
            }
        }
    }

    /// Token check, overflow routing, host claim, stored state load, admit.
    async fn authenticate(&mut self, conn: ConnectionId, token: &str, now: u64) {
        if let Err(refused) = self.world.begin_authentication(conn, now) {
            self.deliver(refused);
            return;
        }
        let identity = match self.services.authenticator.authenticate(token).await {
            Ok(identity) => identity,
            Err(e) => {
                debug!("🔐 Authentication failed on {}: {}", conn, e);
                let refused = self.world.reject_authentication(conn, e.to_string());
                self.deliver(refused);
                return;
            }
        };
        let player = identity.player_id;

        let hosted_here = self.world.player(player).is_some_and(|p| p.online);
        let capacity = self.services.coordinator.config().capacity;
        if !hosted_here && self.world.cache().online_count() >= capacity {
            let routed = self.route_overflow(conn, player);
            self.deliver(routed);
            return;
        }

        if let ClaimOutcome::HostedElsewhere(claim) = self.services.directory.claim(player).await {
            let redirect = self.world.redirect(conn, claim.instance_id, claim.address);
            self.deliver(redirect);
            return;
        }

        let stored = if self.world.player(player).is_some() {
            None
        } else {
            match tokio::time::timeout(self.store_timeout, self.services.store.load_player(player)).await {
                Ok(Ok(record)) => record,
                Ok(Err(e)) => {
                    warn!("⚠️ Could not load player {}: {}", player, e);
                    self.refuse_unavailable(conn, player).await;
                    return;
                }
                Err(_) => {
                    warn!("⚠️ Loading player {} timed out after {:?}", player, self.store_timeout);
                    self.refuse_unavailable(conn, player).await;
                    return;
                }
            }
        };

        let admitted = self.world.admit(conn, identity, stored, current_timestamp_ms());
        self.services
            .coordinator
            .set_player_count(self.world.cache().online_count());
        self.deliver(admitted);
    }

    async fn refuse_unavailable(&mut self, conn: ConnectionId, player: PlayerId) {
        self.services.directory.release(player).await;
        let refused = self.world.reject_authentication(conn, "store_unavailable");
        self.deliver(refused);
    }

    /// This instance is full; send the client to the best peer.
    fn route_overflow(&mut self, conn: ConnectionId, player: PlayerId) -> Vec<Dispatch> {
        let peers = self.services.coordinator.peers();
        for removed in self.selector.sync_pool(&peers) {
            debug!("Selector dropped instance {}", removed);
        }
        match self.selector.select_for_with(player, &mut self.rng) {
            Ok(selection) => {
                let target = selection.instance();
                info!("📦 Instance full, routing player {} to {}", player, target.id);
                self.world.redirect(conn, target.id.clone(), target.address.clone())
            }
            Err(e) => {
                warn!("🚫 Instance full and no peer can take player {}: {}", player, e);
                self.world.reject_authentication(conn, "server_full")
            }
        }
    }

    async fn handle_disconnect(&mut self, conn: ConnectionId, now: u64) {
        self.connections.remove(&conn);
        let departure = self.world.disconnect(conn, now);
        self.deliver(departure.dispatches);
        if let Some(player) = departure.player {
            self.selector.release(player);
            self.services.directory.release(player).await;
            self.services
                .coordinator
                .set_player_count(self.world.cache().online_count());
        }
    }

    async fn handle_tick(&mut self, tick: Tick, now: u64) {
        let store = Arc::clone(&self.services.store);
        match tick {
            Tick::CriticalFlush => {
                let report = self.world.flush_critical(store.as_ref(), now).await;
                if report.critical_flushed > 0 || report.battle_entries_flushed > 0 {
                    trace!(
                        "💾 Critical flush: {} players, {} battle entries",
                        report.critical_flushed,
                        report.battle_entries_flushed
                    );
                }
            }
            Tick::BatchFlush => {
                let report = self.world.flush_batch(store.as_ref(), now).await;
                if !report.evicted.is_empty() {
                    debug!("🧹 {} offline players left hot memory", report.evicted.len());
                }
            }
            Tick::ChunkEviction => {
                self.world.evict_chunks(now);
            }
            Tick::PruneSweep => {
                let (windows, histories) = self.world.prune(now);
                let assignments = self.selector.prune_assignments(now);
                let keys = self.services.coordinator.fabric().purge_expired();
                if windows + histories + assignments + keys > 0 {
                    debug!(
                        "🧹 Pruned {} rate windows, {} movement histories, {} routing assignments and {} expired fabric keys",
                        windows, histories, assignments, keys
                    );
                }
            }
            Tick::Heartbeat => {
                let coordinator = Arc::clone(&self.services.coordinator);
                coordinator.set_player_count(self.world.cache().online_count());
                self.services.directory.refresh(&self.world.online_players()).await;
                coordinator.heartbeat().await;
                let snapshot = self.snapshot(now).await;
                coordinator.publish_stats(&snapshot).await;
            }
            Tick::Election => {
                let coordinator = Arc::clone(&self.services.coordinator);
                let report = coordinator.prune_peers(now).await;
                if !report.leader_lost {
                    coordinator.elect().await;
                }
                for removed in self.selector.sync_pool(&coordinator.peers()) {
                    debug!("Selector dropped instance {}", removed);
                }
            }
            Tick::HealthProbe => {
                let timeout = self.selector.config().probe_timeout;
                for id in self.selector.probe_targets() {
                    match probe_instance(&self.services.coordinator, &id, timeout).await {
                        Some(elapsed) => self.selector.record_success(&id, elapsed),
                        None => self.selector.record_failure(&id),
                    }
                }
            }
            Tick::StatsMonitor => {
                let snapshot = self.snapshot(now).await;
                info!(
                    players = snapshot.world.online_players,
                    connections = snapshot.connections,
                    pending_critical = snapshot.world.pending_critical,
                    pending_batch = snapshot.world.pending_batch,
                    chunks_loaded = snapshot.world.chunks.loaded,
                    fabric_mode = ?snapshot.fabric.mode,
                    fabric_fallbacks = snapshot.fabric.fallback_operations,
                    rate_rejections = snapshot.world.rate_limiter.rejected_total,
                    ip_blocks = snapshot.world.rate_limiter.active_blocks,
                    peers = snapshot.peer_count,
                    leader = snapshot.leader.as_deref().unwrap_or("none"),
                    "📊 Instance {} stats",
                    snapshot.instance_id
                );
            }
        }
    }

    async fn snapshot(&self, now: u64) -> StatsSnapshot {
        let coordinator = &self.services.coordinator;
        let leader = coordinator.leader().await;
        StatsSnapshot {
            instance_id: coordinator.instance_id().to_string(),
            timestamp: now,
            connections: self.connections.len(),
            world: self.world.stats(),
            fabric: coordinator.fabric().stats(),
            selector: self.selector.stats(),
            is_leader: leader.as_deref() == Some(coordinator.instance_id()),
            leader,
            peer_count: coordinator.peer_count(),
        }
    }

    /// Hands dispatches to connection queues. A connection whose queue is
    /// full is dropped; its transport task then disconnects it.
    fn deliver(&mut self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            let to = dispatch.target();
            let Some(sender) = self.connections.get(&to) else {
                continue;
            };
            let (message, closing) = match dispatch {
                Dispatch::Send { event, .. } => (Outbound::Event(event), false),
                Dispatch::Close { reason, .. } => (Outbound::Close(reason), true),
            };
            match sender.try_send(message) {
                Ok(()) => {
                    if closing {
                        self.connections.remove(&to);
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("🐢 Connection {} is not keeping up, dropping it", to);
                    self.connections.remove(&to);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.connections.remove(&to);
                }
            }
        }
    }

    async fn final_flush(&mut self) -> FlushReport {
        let now = current_timestamp_ms();
        for player in self.world.disconnect_all(now) {
            self.services.directory.release(player).await;
        }
        self.services.coordinator.set_player_count(0);
        self.connections.clear();

        let store = Arc::clone(&self.services.store);
        let report = self.world.flush_all(store.as_ref(), now).await;
        if report.is_clean() {
            info!(
                "💾 Final flush wrote {} critical and {} batch players",
                report.critical_flushed, report.batch_flushed
            );
        } else {
            error!("❌ Final flush left state unsaved: {:?}", report.errors);
        }
        report
    }
}
