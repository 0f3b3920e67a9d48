//! # World Handlers
//!
//! [`World`] owns every piece of mutable gameplay state on this instance:
//! the hot state cache, loaded chunks, movement histories, rate windows and
//! combat life states. It is driven by exactly one task, the world loop in
//! [`crate::runtime`], so none of it is behind a lock.
//!
//! Handlers are synchronous and return the [`Dispatch`]es they produced; the
//! caller delivers them. Validation failures are answered to the client as
//! typed rejections and never change state.
//!
//! ## Event Flow
//!
//! ```text
//! connect ─► authenticate ─► admit ─► move / enter_chunk / attack / mine / respawn ─► disconnect
//! ```
//!
//! Authentication itself (token check, host claim, stored player load) needs
//! I/O and is performed by the runtime, which then calls [`World::admit`].

use crate::config::WorldConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use starfall_core::{
    AttackOutcome, ChunkCoord, ChunkManager, ChunkStats, CombatResolver, ConnectionId,
    ContentGenerator, DurableStore, EvictionReport, FlushReport, HotStateCache, Identity,
    InboundEvent, MoveRequest, MovementSample, MovementTracker, MovementValidator, OutboundEvent,
    PeerInfo, PlayerId, PlayerRecord, PlayerState, Position, RateEvent, RateLimitConfig,
    RateLimiter, RateLimiterStats, StateError,
};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, error, info, trace, warn};

/// One message (or instruction) for a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Send { to: ConnectionId, event: OutboundEvent },
    /// Close the connection after everything queued for it was sent
    Close { to: ConnectionId, reason: String },
}

impl Dispatch {
    pub fn send(to: ConnectionId, event: OutboundEvent) -> Self {
        Dispatch::Send { to, event }
    }

    pub fn target(&self) -> ConnectionId {
        match self {
            Dispatch::Send { to, .. } | Dispatch::Close { to, .. } => *to,
        }
    }
}

/// Why a mining attempt was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MineRejection {
    UnknownPlayer,
    PlayerDead,
    UnknownAsteroid,
    Depleted,
    OutOfRange { distance: f64, max: f64 },
}

impl MineRejection {
    pub fn code(&self) -> &'static str {
        match self {
            MineRejection::UnknownPlayer => "unknown_player",
            MineRejection::PlayerDead => "player_dead",
            MineRejection::UnknownAsteroid => "unknown_asteroid",
            MineRejection::Depleted => "depleted",
            MineRejection::OutOfRange { .. } => "out_of_range",
        }
    }
}

impl fmt::Display for MineRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MineRejection::OutOfRange { distance, max } => {
                write!(f, "asteroid is {:.1} away (max {:.1})", distance, max)
            }
            other => f.write_str(other.code()),
        }
    }
}

/// What a disconnect left behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Departure {
    /// The player that went offline, if the connection was authenticated
    pub player: Option<PlayerId>,
    pub dispatches: Vec<Dispatch>,
}

/// World-owned counters for the stats snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldStats {
    pub connections: usize,
    pub online_players: usize,
    pub hosted_players: usize,
    pub pending_critical: usize,
    pub pending_batch: usize,
    /// Players whose critical state keeps failing to persist
    pub persist_alerts: usize,
    pub dead_players: usize,
    pub movement_histories: usize,
    pub chunks: ChunkStats,
    pub rate_limiter: RateLimiterStats,
}

#[derive(Debug, Clone)]
struct Session {
    ip: IpAddr,
    player: Option<PlayerId>,
}

/// All gameplay state of one instance.
pub struct World {
    config: WorldConfig,
    cache: HotStateCache,
    chunks: ChunkManager,
    validator: MovementValidator,
    tracker: MovementTracker,
    limiter: RateLimiter,
    combat: CombatResolver,
    sessions: HashMap<ConnectionId, Session>,
    rng: StdRng,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World").field("stats", &self.stats()).finish()
    }
}

impl World {
    pub fn new(config: WorldConfig, rate_limits: RateLimitConfig, critical_failure_alert: u32) -> Self {
        Self::with_rng(config, rate_limits, critical_failure_alert, StdRng::from_entropy())
    }

    /// A world with a fixed RNG, for reproducible critical hits.
    pub fn with_rng(
        config: WorldConfig,
        rate_limits: RateLimitConfig,
        critical_failure_alert: u32,
        rng: StdRng,
    ) -> Self {
        let generator = ContentGenerator::new(config.generator.clone());
        Self {
            cache: HotStateCache::new(critical_failure_alert),
            chunks: ChunkManager::new(generator, config.eviction.clone()),
            validator: MovementValidator::new(config.movement.clone()),
            tracker: MovementTracker::from_config(&config.movement),
            limiter: RateLimiter::new(rate_limits),
            combat: CombatResolver::new(config.combat.clone()),
            sessions: HashMap::new(),
            rng,
            config,
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn cache(&self) -> &HotStateCache {
        &self.cache
    }

    pub fn chunks(&self) -> &ChunkManager {
        &self.chunks
    }

    pub fn tracker(&self) -> &MovementTracker {
        &self.tracker
    }

    pub fn combat(&self) -> &CombatResolver {
        &self.combat
    }

    pub fn player(&self, id: PlayerId) -> Option<&PlayerState> {
        self.cache.get(id)
    }

    pub fn session_player(&self, conn: ConnectionId) -> Option<PlayerId> {
        self.sessions.get(&conn).and_then(|s| s.player)
    }

    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.sessions.contains_key(&conn)
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Players currently hosted and online here.
    pub fn online_players(&self) -> Vec<PlayerId> {
        let mut players: Vec<PlayerId> = self
            .cache
            .players()
            .filter(|p| p.online)
            .map(|p| p.id)
            .collect();
        players.sort();
        players
    }

    fn spawn_chunk(&self) -> ChunkCoord {
        ChunkCoord::containing(self.config.spawn_point, self.chunks.chunk_size())
            .unwrap_or(ChunkCoord::ORIGIN)
    }

    /// Registers a new, unauthenticated connection.
    pub fn connect(&mut self, conn: ConnectionId, ip: IpAddr) {
        trace!("🔗 Session {} opened from {}", conn, ip);
        self.sessions.insert(conn, Session { ip, player: None });
    }

    /// Runs the rate limiter for one request on `conn`.
    pub fn check_rate(&mut self, conn: ConnectionId, event: RateEvent, now: u64) -> Result<(), Vec<Dispatch>> {
        let Some(session) = self.sessions.get(&conn) else {
            return Err(Vec::new());
        };
        let (ip, player) = (session.ip, session.player);
        self.limiter.check(event, ip, player, now).map_err(|rejection| {
            debug!("🚦 Connection {} rate limited: {}", conn, rejection);
            vec![Dispatch::send(
                conn,
                OutboundEvent::RateLimited {
                    retry_after_ms: rejection.retry_after_ms,
                },
            )]
        })
    }

    /// Gate in front of authentication: rate limit and duplicate check.
    pub fn begin_authentication(&mut self, conn: ConnectionId, now: u64) -> Result<(), Vec<Dispatch>> {
        if self.session_player(conn).is_some() {
            return Err(vec![Dispatch::send(
                conn,
                OutboundEvent::rejected("authenticate", "already_authenticated"),
            )]);
        }
        self.check_rate(conn, RateEvent::Authenticate, now)
    }

    /// Answers a failed authentication.
    pub fn reject_authentication(&self, conn: ConnectionId, reason: impl Into<String>) -> Vec<Dispatch> {
        vec![Dispatch::send(
            conn,
            OutboundEvent::AuthResult {
                ok: false,
                player_id: None,
                error: Some(reason.into()),
            },
        )]
    }

    /// Sends the client to the instance that already hosts its player.
    pub fn redirect(&self, conn: ConnectionId, instance_id: String, address: String) -> Vec<Dispatch> {
        vec![
            Dispatch::send(conn, OutboundEvent::Migrate { instance_id, address }),
            Dispatch::Close {
                to: conn,
                reason: "migrated".to_string(),
            },
        ]
    }

    /// Brings an authenticated player into the world on `conn`.
    ///
    /// Hot state wins over `stored`: a player reconnecting before their
    /// offline flush completed keeps every unflushed change. An existing
    /// live connection for the same player is replaced.
    pub fn admit(
        &mut self,
        conn: ConnectionId,
        identity: Identity,
        stored: Option<PlayerRecord>,
        now: u64,
    ) -> Vec<Dispatch> {
        let mut out = Vec::new();
        match self.sessions.get(&conn) {
            None => {
                debug!("Connection {} closed before authentication completed", conn);
                return out;
            }
            Some(session) if session.player.is_some() => {
                out.push(Dispatch::send(
                    conn,
                    OutboundEvent::rejected("authenticate", "already_authenticated"),
                ));
                return out;
            }
            Some(_) => {}
        }

        let id = identity.player_id;
        let previous = self.cache.get(id).filter(|p| p.online).and_then(|p| p.connection);
        let replacing = self.cache.get(id).is_some_and(|p| p.online);
        if let Some(old) = previous.filter(|old| *old != conn) {
            if let Some(old_session) = self.sessions.get_mut(&old) {
                old_session.player = None;
            }
            info!("🔁 Player {} reconnected on {}, replacing session {}", id, conn, old);
            out.push(Dispatch::send(old, OutboundEvent::SessionReplaced));
            out.push(Dispatch::Close {
                to: old,
                reason: "session replaced".to_string(),
            });
        }

        let state = match self.cache.get(id) {
            Some(existing) => existing.clone(),
            None => match stored {
                Some(record) => PlayerState::from_record(record),
                None => {
                    info!("🌱 New player {} ({})", identity.name, id);
                    PlayerState::new(id, identity.name.clone(), self.config.spawn_point, self.spawn_chunk(), now)
                }
            },
        };
        let chunk = state.chunk;
        let position = state.position;

        self.cache.upsert_on_connect(id, state);
        if let Err(e) = self.cache.attach_connection(id, conn) {
            error!("❌ Could not attach {} to player {}: {}", conn, id, e);
            return out;
        }
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.player = Some(id);
        }
        self.tracker.seed(id, position, now);

        out.push(Dispatch::send(
            conn,
            OutboundEvent::AuthResult {
                ok: true,
                player_id: Some(id),
                error: None,
            },
        ));
        self.chunks.get_or_load(chunk, now);
        if !replacing {
            self.chunks.enter(id, chunk);
            out.extend(self.peer_joined(chunk, id));
        }
        out.push(Dispatch::send(conn, self.snapshot(chunk, id, now)));
        info!("👋 Player {} ({}) entered the world in chunk {}", identity.name, id, chunk);
        out
    }

    /// Handles gameplay events on an authenticated connection.
    ///
    /// `authenticate`, `stats` and `disconnect` need I/O or the connection
    /// registry and are handled by the runtime before reaching here.
    pub fn handle(&mut self, conn: ConnectionId, event: InboundEvent, now: u64) -> Vec<Dispatch> {
        let action = event.name();
        if let Some(rate_event) = event.rate_event() {
            if let Err(limited) = self.check_rate(conn, rate_event, now) {
                return limited;
            }
        }
        let Some(player) = self.session_player(conn) else {
            return vec![Dispatch::send(conn, OutboundEvent::rejected(action, "not_authenticated"))];
        };

        let claimed_chunk = event.claimed_chunk();
        match event {
            InboundEvent::Move { x, y, .. } => self.handle_move(conn, player, Position::new(x, y), claimed_chunk, now),
            InboundEvent::EnterChunk { chunk_x, chunk_y } => {
                self.handle_enter_chunk(conn, player, ChunkCoord::new(chunk_x, chunk_y), now)
            }
            InboundEvent::Attack { target_id } => self.handle_attack(conn, player, target_id, now),
            InboundEvent::Respawn => self.handle_respawn(conn, player, now),
            InboundEvent::Mine { asteroid_id } => self.handle_mine(conn, player, asteroid_id, now),
            InboundEvent::Authenticate { .. } | InboundEvent::Stats | InboundEvent::Disconnect { .. } => {
                warn!("⚠️ '{}' from {} reached the world handlers", action, conn);
                Vec::new()
            }
        }
    }

    fn handle_move(
        &mut self,
        conn: ConnectionId,
        player: PlayerId,
        position: Position,
        claimed_chunk: Option<ChunkCoord>,
        now: u64,
    ) -> Vec<Dispatch> {
        let Some(state) = self.cache.get(player) else {
            return vec![Dispatch::send(conn, OutboundEvent::rejected("move", "unknown_player"))];
        };
        if !state.is_alive() {
            return vec![Dispatch::send(conn, OutboundEvent::rejected("move", "player_dead"))];
        }

        let request = MoveRequest {
            position,
            claimed_chunk,
            timestamp: now,
        };
        let old_chunk = state.chunk;
        let history = self.tracker.history(player);
        let chunk = match self.validator.validate(&request, &history, state) {
            Ok(chunk) => chunk,
            Err(rejection) => {
                debug!("🚫 Move by {} rejected: {}", player, rejection.reason);
                return vec![Dispatch::send(
                    conn,
                    OutboundEvent::PositionCorrected {
                        x: rejection.last_good.x,
                        y: rejection.last_good.y,
                        reason: rejection.reason.code().to_string(),
                    },
                )];
            }
        };

        if let Err(e) = self.cache.update_position(player, position, chunk) {
            return self.internal_failure(conn, "move", e);
        }
        self.tracker.record(player, MovementSample { position, timestamp: now });

        if chunk == old_chunk {
            let event = OutboundEvent::PeerMoved {
                id: player,
                x: position.x,
                y: position.y,
            };
            return self.broadcast(old_chunk, Some(player), event);
        }
        self.transition(conn, player, old_chunk, chunk, now)
    }

    /// Moves presence between chunks and tells everyone involved.
    fn transition(
        &mut self,
        conn: ConnectionId,
        player: PlayerId,
        from: ChunkCoord,
        to: ChunkCoord,
        now: u64,
    ) -> Vec<Dispatch> {
        self.chunks.leave(player, from);
        let mut out = self.broadcast(from, Some(player), OutboundEvent::PeerLeft { id: player });

        self.chunks.get_or_load(to, now);
        self.chunks.enter(player, to);
        out.extend(self.peer_joined(to, player));
        out.push(Dispatch::send(conn, self.snapshot(to, player, now)));
        debug!("🧭 Player {} moved from chunk {} to {}", player, from, to);
        out
    }

    fn handle_enter_chunk(&mut self, conn: ConnectionId, player: PlayerId, coord: ChunkCoord, now: u64) -> Vec<Dispatch> {
        let Some(state) = self.cache.get(player) else {
            return vec![Dispatch::send(conn, OutboundEvent::rejected("enter_chunk", "unknown_player"))];
        };
        let radius = self.config.movement.world_radius_chunks.unsigned_abs();
        if coord.x.unsigned_abs() > radius || coord.y.unsigned_abs() > radius {
            return vec![Dispatch::send(conn, OutboundEvent::rejected("enter_chunk", "out_of_bounds"))];
        }
        // the current chunk or one of its eight neighbours
        let current = state.chunk;
        let dx = (coord.x as i64 - current.x as i64).abs();
        let dy = (coord.y as i64 - current.y as i64).abs();
        if dx.max(dy) > 1 {
            return vec![Dispatch::send(conn, OutboundEvent::rejected("enter_chunk", "not_adjacent"))];
        }
        vec![Dispatch::send(conn, self.snapshot(coord, player, now))]
    }

    fn handle_attack(&mut self, conn: ConnectionId, attacker: PlayerId, target: PlayerId, now: u64) -> Vec<Dispatch> {
        let outcome: AttackOutcome =
            match self.combat.resolve_attack(&mut self.cache, attacker, target, now, &mut self.rng) {
                Ok(outcome) => outcome,
                Err(rejection) => {
                    debug!("🛡️ Attack {} -> {} rejected: {:?}", attacker, target, rejection);
                    return vec![Dispatch::send(conn, OutboundEvent::rejected("attack", rejection.code()))];
                }
            };

        let hit = OutboundEvent::Hit {
            attacker_id: outcome.attacker,
            target_id: outcome.defender,
            damage: outcome.damage,
            is_critical: outcome.is_critical,
            health: outcome.health_after,
            fatal: outcome.fatal,
        };
        let mut out = self.broadcast(outcome.chunk, None, hit);
        if outcome.fatal {
            if let Some(defender_conn) = self.cache.get(outcome.defender).and_then(|p| p.connection) {
                out.push(Dispatch::send(
                    defender_conn,
                    OutboundEvent::Death {
                        killer_id: outcome.attacker,
                        respawn_delay_ms: outcome.respawn_delay_ms,
                    },
                ));
            }
        }
        out
    }

    fn handle_respawn(&mut self, conn: ConnectionId, player: PlayerId, now: u64) -> Vec<Dispatch> {
        let Some(old_chunk) = self.cache.get(player).map(|p| p.chunk) else {
            return vec![Dispatch::send(conn, OutboundEvent::rejected("respawn", "unknown_player"))];
        };
        let outcome = match self.combat.resolve_respawn(&mut self.cache, player, now) {
            Ok(outcome) => outcome,
            Err(rejection) => {
                return vec![Dispatch::send(conn, OutboundEvent::rejected("respawn", rejection.code()))];
            }
        };
        self.tracker.seed(player, outcome.position, now);

        let mut out = vec![Dispatch::send(
            conn,
            OutboundEvent::Respawned {
                x: outcome.position.x,
                y: outcome.position.y,
                health: outcome.health,
            },
        )];
        if outcome.chunk == old_chunk {
            out.extend(self.broadcast(
                old_chunk,
                Some(player),
                OutboundEvent::PeerMoved {
                    id: player,
                    x: outcome.position.x,
                    y: outcome.position.y,
                },
            ));
            out.push(Dispatch::send(conn, self.snapshot(old_chunk, player, now)));
        } else {
            out.extend(self.transition(conn, player, old_chunk, outcome.chunk, now));
        }
        out
    }

    /// Validates a mining attempt without changing anything.
    fn check_mine(&mut self, player: PlayerId, asteroid_id: u32, now: u64) -> Result<(ChunkCoord, u64), MineRejection> {
        let state = self.cache.get(player).ok_or(MineRejection::UnknownPlayer)?;
        if !state.is_alive() {
            return Err(MineRejection::PlayerDead);
        }
        let (coord, position) = (state.chunk, state.position);
        let chunk = self.chunks.get_or_load(coord, now);
        let asteroid = chunk.asteroid(asteroid_id).ok_or(MineRejection::UnknownAsteroid)?;
        if chunk.is_depleted(asteroid_id) {
            return Err(MineRejection::Depleted);
        }
        let distance = position.distance(asteroid.position);
        if distance > self.config.mine_range {
            return Err(MineRejection::OutOfRange {
                distance,
                max: self.config.mine_range,
            });
        }
        Ok((coord, asteroid.quantity as u64))
    }

    fn handle_mine(&mut self, conn: ConnectionId, player: PlayerId, asteroid_id: u32, now: u64) -> Vec<Dispatch> {
        let (coord, amount) = match self.check_mine(player, asteroid_id, now) {
            Ok(found) => found,
            Err(rejection) => {
                debug!("⛏️ Mine by {} rejected: {}", player, rejection);
                return vec![Dispatch::send(conn, OutboundEvent::rejected("mine", rejection.code()))];
            }
        };

        let total = match self.cache.collect_resource(player, amount) {
            Ok(total) => total,
            Err(e) => return self.internal_failure(conn, "mine", e),
        };
        self.chunks.deplete(coord, asteroid_id, now);
        debug!("⛏️ Player {} mined asteroid {} in {} for {}", player, asteroid_id, coord, amount);

        let mut out = vec![Dispatch::send(
            conn,
            OutboundEvent::ResourceCollected {
                asteroid_id,
                amount,
                total,
            },
        )];
        out.extend(self.broadcast(coord, Some(player), OutboundEvent::AsteroidDepleted { asteroid_id }));
        out
    }

    /// Tears down a connection. Only the connection currently owning the
    /// player takes it offline; a replaced session just goes away.
    pub fn disconnect(&mut self, conn: ConnectionId, now: u64) -> Departure {
        let Some(session) = self.sessions.remove(&conn) else {
            return Departure::default();
        };
        let Some(player) = session.player else {
            return Departure::default();
        };
        let owns_player = self.cache.get(player).and_then(|p| p.connection) == Some(conn);
        if !owns_player {
            return Departure::default();
        }

        let chunk = self.cache.get(player).map(|p| p.chunk);
        if let Err(e) = self.cache.mark_offline(player) {
            error!("❌ Failed to mark {} offline: {}", player, e);
        }
        self.tracker.remove(player);
        self.combat.forget(player);

        let mut dispatches = Vec::new();
        if let Some(chunk) = chunk {
            self.chunks.leave(player, chunk);
            dispatches = self.broadcast(chunk, None, OutboundEvent::PeerLeft { id: player });
            self.chunks.get_or_load(chunk, now);
        }
        info!("👋 Player {} left the world ({})", player, conn);
        Departure {
            player: Some(player),
            dispatches,
        }
    }

    /// Disconnects every session. Used at shutdown so the final flush
    /// records everyone as offline.
    pub fn disconnect_all(&mut self, now: u64) -> Vec<PlayerId> {
        let mut conns: Vec<ConnectionId> = self.sessions.keys().copied().collect();
        conns.sort();
        conns
            .into_iter()
            .filter_map(|conn| self.disconnect(conn, now).player)
            .collect()
    }

    /// Chunk eviction tick.
    pub fn evict_chunks(&mut self, now: u64) -> EvictionReport {
        let report = self.chunks.evict_idle(now);
        if report.total() > 0 {
            debug!(
                "🧹 Evicted {} chunks ({} idle, {} over ceiling)",
                report.total(),
                report.expired.len(),
                report.forced.len()
            );
        }
        report
    }

    /// Rate window and movement history sweep. Returns `(windows, histories)` pruned.
    pub fn prune(&mut self, now: u64) -> (usize, usize) {
        (self.limiter.sweep(now), self.tracker.prune_inactive(now))
    }

    /// Critical tier flush: deaths, disconnects, respawns and the battle log.
    pub async fn flush_critical(&mut self, store: &dyn DurableStore, now: u64) -> FlushReport {
        self.cache.flush_critical(store, now).await
    }

    /// Batch tier flush plus newly generated chunk records.
    pub async fn flush_batch(&mut self, store: &dyn DurableStore, now: u64) -> FlushReport {
        let mut report = self.cache.flush_batch(store, now).await;
        self.persist_chunk_records(store, &mut report).await;
        report
    }

    /// Everything pending, both tiers. Used at shutdown.
    pub async fn flush_all(&mut self, store: &dyn DurableStore, now: u64) -> FlushReport {
        let mut report = self.cache.flush(store, now).await;
        self.persist_chunk_records(store, &mut report).await;
        report
    }

    async fn persist_chunk_records(&mut self, store: &dyn DurableStore, report: &mut FlushReport) {
        let records = self.chunks.drain_new_records();
        if records.is_empty() {
            return;
        }
        if let Err(e) = store.append_chunks(&records).await {
            warn!("⚠️ Chunk record append failed ({} kept): {}", records.len(), e);
            report.errors.push(e.to_string());
            self.chunks.requeue_records(records);
        }
    }

    pub fn stats(&self) -> WorldStats {
        let (pending_critical, pending_batch) = self.cache.pending_counts();
        WorldStats {
            connections: self.sessions.len(),
            online_players: self.cache.online_count(),
            hosted_players: self.cache.len(),
            pending_critical,
            pending_batch,
            persist_alerts: self.cache.alerting_count(),
            dead_players: self.combat.dead_count(),
            movement_histories: self.tracker.len(),
            chunks: self.chunks.stats(),
            rate_limiter: self.limiter.stats(),
        }
    }

    fn peer_info(&self, id: PlayerId) -> Option<PeerInfo> {
        self.cache.get(id).filter(|p| p.online).map(|p| PeerInfo {
            id: p.id,
            name: p.name.clone(),
            x: p.position.x,
            y: p.position.y,
            health: p.health,
        })
    }

    fn peer_joined(&self, chunk: ChunkCoord, player: PlayerId) -> Vec<Dispatch> {
        match self.peer_info(player) {
            Some(info) => self.broadcast(
                chunk,
                Some(player),
                OutboundEvent::PeerJoined {
                    id: info.id,
                    name: info.name,
                    x: info.x,
                    y: info.y,
                    health: info.health,
                },
            ),
            None => Vec::new(),
        }
    }

    /// Full view of `coord` for `viewer`.
    fn snapshot(&mut self, coord: ChunkCoord, viewer: PlayerId, now: u64) -> OutboundEvent {
        let chunk = self.chunks.get_or_load(coord, now);
        let zone = chunk.zone.clone();
        let content = chunk.available_asteroids().cloned().collect();
        let other_players = self
            .chunks
            .occupants(coord)
            .into_iter()
            .filter(|id| *id != viewer)
            .filter_map(|id| self.peer_info(id))
            .collect();
        OutboundEvent::ChunkSnapshot {
            chunk: coord,
            zone,
            content,
            other_players,
        }
    }

    /// `event` to every online occupant of `chunk` except `except`.
    fn broadcast(&self, chunk: ChunkCoord, except: Option<PlayerId>, event: OutboundEvent) -> Vec<Dispatch> {
        self.chunks
            .occupants(chunk)
            .into_iter()
            .filter(|id| Some(*id) != except)
            .filter_map(|id| self.cache.get(id).filter(|p| p.online).and_then(|p| p.connection))
            .map(|to| Dispatch::send(to, event.clone()))
            .collect()
    }

    fn internal_failure(&self, conn: ConnectionId, action: &str, e: StateError) -> Vec<Dispatch> {
        error!("❌ '{}' handler aborted for {}: {}", action, conn, e);
        vec![Dispatch::send(conn, OutboundEvent::rejected(action, "internal_error"))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starfall_core::{MemoryStore, ZoneTier};
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn world() -> World {
        World::with_rng(
            WorldConfig::default(),
            RateLimitConfig::default(),
            3,
            StdRng::seed_from_u64(42),
        )
    }

    fn join(world: &mut World, conn: u64, name: &str, now: u64) -> (ConnectionId, PlayerId) {
        let conn = ConnectionId(conn);
        world.connect(conn, IP);
        world.begin_authentication(conn, now).unwrap();
        let identity = Identity {
            player_id: PlayerId::from_account_name(name),
            name: name.to_string(),
        };
        let id = identity.player_id;
        world.admit(conn, identity, None, now);
        (conn, id)
    }

    fn events_for(dispatches: &[Dispatch], conn: ConnectionId) -> Vec<&OutboundEvent> {
        dispatches
            .iter()
            .filter_map(|d| match d {
                Dispatch::Send { to, event } if *to == conn => Some(event),
                _ => None,
            })
            .collect()
    }

    fn kinds(dispatches: &[Dispatch], conn: ConnectionId) -> Vec<&'static str> {
        events_for(dispatches, conn).iter().map(|e| e.kind()).collect()
    }

    #[test]
    fn test_admit_spawns_player_and_sends_snapshot() {
        let mut w = world();
        let conn = ConnectionId(1);
        w.connect(conn, IP);
        let identity = Identity {
            player_id: PlayerId::from_account_name("vega"),
            name: "vega".into(),
        };
        let out = w.admit(conn, identity.clone(), None, 1_000);
        assert_eq!(kinds(&out, conn), vec!["auth_result", "chunk_snapshot"]);

        let state = w.player(identity.player_id).unwrap();
        assert!(state.online && state.in_world);
        assert_eq!(state.position, Position::new(500.0, 500.0));
        assert_eq!(state.connection, Some(conn));
        assert_eq!(w.chunks().occupants(ChunkCoord::ORIGIN), vec![identity.player_id]);
    }

    #[test]
    fn test_second_player_sees_first_and_first_is_notified() {
        let mut w = world();
        let (a_conn, a) = join(&mut w, 1, "vega", 1_000);
        let b_conn = ConnectionId(2);
        w.connect(b_conn, IP);
        let out = w.admit(
            b_conn,
            Identity {
                player_id: PlayerId::from_account_name("orion"),
                name: "orion".into(),
            },
            None,
            1_000,
        );
        assert_eq!(kinds(&out, a_conn), vec!["peer_joined"]);
        match events_for(&out, b_conn).last() {
            Some(OutboundEvent::ChunkSnapshot { other_players, .. }) => {
                assert_eq!(other_players.len(), 1);
                assert_eq!(other_players[0].id, a);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_unauthenticated_gameplay_is_rejected() {
        let mut w = world();
        let conn = ConnectionId(1);
        w.connect(conn, IP);
        let out = w.handle(conn, InboundEvent::Respawn, 1_000);
        assert_eq!(
            events_for(&out, conn),
            vec![&OutboundEvent::rejected("respawn", "not_authenticated")]
        );
    }

    #[test]
    fn test_accepted_move_broadcasts_to_peers_only() {
        let mut w = world();
        let (a_conn, a) = join(&mut w, 1, "vega", 1_000);
        let (b_conn, _) = join(&mut w, 2, "orion", 1_000);

        let out = w.handle(a_conn, InboundEvent::Move { x: 550.0, y: 500.0, chunk_x: None, chunk_y: None }, 1_500);
        assert!(events_for(&out, a_conn).is_empty());
        assert_eq!(
            events_for(&out, b_conn),
            vec![&OutboundEvent::PeerMoved { id: a, x: 550.0, y: 500.0 }]
        );
        assert_eq!(w.player(a).unwrap().position, Position::new(550.0, 500.0));
    }

    #[test]
    fn test_speeding_move_is_corrected_without_mutation() {
        let mut w = world();
        let (conn, id) = join(&mut w, 1, "vega", 1_000);
        let before = w.player(id).unwrap().clone();

        let out = w.handle(conn, InboundEvent::Move { x: 900.0, y: 500.0, chunk_x: None, chunk_y: None }, 1_100);
        assert_eq!(
            events_for(&out, conn),
            vec![&OutboundEvent::PositionCorrected {
                x: 500.0,
                y: 500.0,
                reason: "speed_exceeded".into()
            }]
        );
        assert_eq!(w.player(id).unwrap(), &before);
        assert_eq!(w.tracker().history_ref(id).map(|h| h.len()), Some(1));
    }

    #[test]
    fn test_crossing_a_chunk_border_transitions_presence() {
        let mut w = world();
        let (a_conn, a) = join(&mut w, 1, "vega", 1_000);
        let (b_conn, _) = join(&mut w, 2, "orion", 1_000);

        // 500 units in one second stays under the 600 u/s cap
        let out = w.handle(
            a_conn,
            InboundEvent::Move { x: 1_000.5, y: 500.0, chunk_x: Some(1), chunk_y: Some(0) },
            2_000,
        );
        assert_eq!(kinds(&out, b_conn), vec!["peer_left"]);
        assert_eq!(kinds(&out, a_conn), vec!["chunk_snapshot"]);
        assert_eq!(w.player(a).unwrap().chunk, ChunkCoord::new(1, 0));
        assert_eq!(w.chunks().occupants(ChunkCoord::new(1, 0)), vec![a]);
        assert!(!w.chunks().occupants(ChunkCoord::ORIGIN).contains(&a));
    }

    #[test]
    fn test_attack_in_safe_zone_is_rejected() {
        let mut w = world();
        let (a_conn, _) = join(&mut w, 1, "vega", 1_000);
        let (_, b) = join(&mut w, 2, "orion", 1_000);
        assert_eq!(zone_tier_of(&w, ChunkCoord::ORIGIN), ZoneTier::Safe);

        let out = w.handle(a_conn, InboundEvent::Attack { target_id: b }, 1_100);
        assert_eq!(
            events_for(&out, a_conn),
            vec![&OutboundEvent::rejected("attack", "pvp_disabled")]
        );
        assert_eq!(w.player(b).unwrap().health, 100);
    }

    fn zone_tier_of(w: &World, coord: ChunkCoord) -> ZoneTier {
        w.chunks().get(coord).map(|c| c.zone.tier).unwrap_or(ZoneTier::Safe)
    }

    #[test]
    fn test_mining_credits_and_depletes() {
        let mut w = world();
        let (a_conn, a) = join(&mut w, 1, "vega", 1_000);
        let (b_conn, _) = join(&mut w, 2, "orion", 1_000);

        // put the miner right on top of an asteroid by restoring state there
        let asteroid = w.chunks().get(ChunkCoord::ORIGIN).unwrap().asteroids[0].clone();
        w.cache.update_position(a, asteroid.position, ChunkCoord::ORIGIN).unwrap();

        let out = w.handle(a_conn, InboundEvent::Mine { asteroid_id: asteroid.id }, 1_100);
        assert_eq!(
            events_for(&out, a_conn),
            vec![&OutboundEvent::ResourceCollected {
                asteroid_id: asteroid.id,
                amount: asteroid.quantity as u64,
                total: asteroid.quantity as u64,
            }]
        );
        assert_eq!(
            events_for(&out, b_conn),
            vec![&OutboundEvent::AsteroidDepleted { asteroid_id: asteroid.id }]
        );

        let again = w.handle(a_conn, InboundEvent::Mine { asteroid_id: asteroid.id }, 1_200);
        assert_eq!(events_for(&again, a_conn), vec![&OutboundEvent::rejected("mine", "depleted")]);
        assert_eq!(w.player(a).unwrap().resources, asteroid.quantity as u64);
    }

    #[test]
    fn test_mining_out_of_range_is_rejected() {
        let mut w = world();
        let (conn, id) = join(&mut w, 1, "vega", 1_000);
        let far = w
            .chunks()
            .get(ChunkCoord::ORIGIN)
            .unwrap()
            .asteroids
            .iter()
            .find(|a| a.position.distance(Position::new(500.0, 500.0)) > 150.0)
            .cloned();
        if let Some(asteroid) = far {
            let out = w.handle(conn, InboundEvent::Mine { asteroid_id: asteroid.id }, 1_100);
            assert_eq!(events_for(&out, conn), vec![&OutboundEvent::rejected("mine", "out_of_range")]);
            assert_eq!(w.player(id).unwrap().resources, 0);
        }
        let out = w.handle(conn, InboundEvent::Mine { asteroid_id: 9_999 }, 1_200);
        assert_eq!(events_for(&out, conn), vec![&OutboundEvent::rejected("mine", "unknown_asteroid")]);
    }

    #[test]
    fn test_mining_without_player_state_names_the_player() {
        let mut w = world();
        let (_, id) = join(&mut w, 1, "vega", 1_000);
        let asteroid = w.chunks().get(ChunkCoord::ORIGIN).unwrap().asteroids[0].id;
        assert_eq!(
            w.check_mine(PlayerId::new(), asteroid, 1_100).unwrap_err(),
            MineRejection::UnknownPlayer
        );
        assert_eq!(MineRejection::UnknownPlayer.code(), "unknown_player");
        assert!(w.check_mine(id, 9_999, 1_100).is_err());
    }

    #[test]
    fn test_enter_chunk_allows_neighbours_only() {
        let mut w = world();
        let (conn, _) = join(&mut w, 1, "vega", 1_000);
        let out = w.handle(conn, InboundEvent::EnterChunk { chunk_x: 1, chunk_y: -1 }, 1_100);
        assert_eq!(kinds(&out, conn), vec!["chunk_snapshot"]);
        let out = w.handle(conn, InboundEvent::EnterChunk { chunk_x: 5, chunk_y: 0 }, 1_200);
        assert_eq!(events_for(&out, conn), vec![&OutboundEvent::rejected("enter_chunk", "not_adjacent")]);
    }

    #[test]
    fn test_session_replacement() {
        let mut w = world();
        let (old_conn, id) = join(&mut w, 1, "vega", 1_000);
        let new_conn = ConnectionId(2);
        w.connect(new_conn, IP);
        let out = w.admit(
            new_conn,
            Identity {
                player_id: id,
                name: "vega".into(),
            },
            None,
            2_000,
        );
        assert_eq!(kinds(&out, old_conn), vec!["session_replaced"]);
        assert!(out.contains(&Dispatch::Close {
            to: old_conn,
            reason: "session replaced".into()
        }));
        assert_eq!(w.player(id).unwrap().connection, Some(new_conn));

        // the stale connection closing must not take the player offline
        let departure = w.disconnect(old_conn, 2_100);
        assert_eq!(departure.player, None);
        assert!(w.player(id).unwrap().online);
    }

    #[test]
    fn test_disconnect_notifies_peers_and_marks_offline() {
        let mut w = world();
        let (a_conn, a) = join(&mut w, 1, "vega", 1_000);
        let (b_conn, _) = join(&mut w, 2, "orion", 1_000);

        let departure = w.disconnect(a_conn, 2_000);
        assert_eq!(departure.player, Some(a));
        assert_eq!(kinds(&departure.dispatches, b_conn), vec!["peer_left"]);
        assert!(!w.player(a).unwrap().online);
        assert_eq!(w.cache().pending_counts().0, 1);
        assert!(w.tracker().history_ref(a).is_none());
    }

    #[tokio::test]
    async fn test_flush_persists_players_and_chunks() {
        let mut w = world();
        let (conn, id) = join(&mut w, 1, "vega", 1_000);
        let store = MemoryStore::new();

        let report = w.flush_batch(&store, 2_000).await;
        assert!(report.is_clean());
        assert!(store.player(id).await.is_some());
        assert_eq!(store.chunk_records().await.len(), 1);

        w.disconnect(conn, 3_000);
        w.flush_critical(&store, 3_000).await;
        assert!(!store.player(id).await.unwrap().online);
        assert!(w.player(id).is_none());
    }

    #[tokio::test]
    async fn test_failed_chunk_append_is_retried() {
        let mut w = world();
        join(&mut w, 1, "vega", 1_000);
        let store = MemoryStore::new();
        store.set_failing(true);
        let report = w.flush_batch(&store, 2_000).await;
        assert!(!report.is_clean());
        assert_eq!(w.chunks().pending_record_count(), 1);

        store.set_failing(false);
        w.flush_batch(&store, 3_000).await;
        assert_eq!(w.chunks().pending_record_count(), 0);
        assert_eq!(store.chunk_records().await.len(), 1);
    }
}
