//! Client-side model of one simulated player.
//!
//! [`Bot`] mirrors what a real client knows about the world from the events
//! it receives, and decides what to send next: legal moves along a random
//! walk, attacks on nearby peers and mining of nearby asteroids. It never
//! touches the network, so its decisions can be tested directly.

use rand::Rng;
use starfall_core::{Asteroid, ChunkCoord, InboundEvent, OutboundEvent, PlayerId, Position};
use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;

/// Tunables for the simulated behaviour.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Cruise speed in units per second; must stay under the server's limit
    pub speed: f64,
    pub chunk_size: f64,
    /// Waypoints are picked within this distance of the current position
    pub wander_radius: f64,
    pub attack_range: f64,
    pub mine_range: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            speed: 200.0,
            chunk_size: 1000.0,
            wander_radius: 800.0,
            attack_range: 400.0,
            mine_range: 150.0,
        }
    }
}

/// What one bot observed during its run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BotCounters {
    pub sent: u64,
    pub received: u64,
    pub corrections: u64,
    pub rate_limited: u64,
    pub rejections: u64,
    pub hits_dealt: u64,
    pub hits_taken: u64,
    pub kills: u64,
    pub deaths: u64,
    pub asteroids_mined: u64,
    pub resources: u64,
    pub migrations: u64,
}

impl AddAssign for BotCounters {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.received += other.received;
        self.corrections += other.corrections;
        self.rate_limited += other.rate_limited;
        self.rejections += other.rejections;
        self.hits_dealt += other.hits_dealt;
        self.hits_taken += other.hits_taken;
        self.kills += other.kills;
        self.deaths += other.deaths;
        self.asteroids_mined += other.asteroids_mined;
        self.resources += other.resources;
        self.migrations += other.migrations;
    }
}

/// Outcome of applying one server event that the connection loop must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    None,
    /// Authentication failed; stop this bot
    Refused(String),
    /// Reconnect to another instance
    Migrate { address: String },
    /// Another login took over this player
    Replaced,
}

#[derive(Debug)]
pub struct Bot {
    pub name: String,
    config: BotConfig,
    id: Option<PlayerId>,
    position: Position,
    chunk: Option<ChunkCoord>,
    waypoint: Option<Position>,
    peers: HashMap<PlayerId, Position>,
    asteroids: Vec<Asteroid>,
    depleted: HashSet<u32>,
    pvp_allowed: bool,
    dead_until: Option<u64>,
    /// Moves are held back until this time after a rate limit
    move_cooldown_until: u64,
    /// A rate-limited login is retried at this time
    auth_retry_at: Option<u64>,
    pub counters: BotCounters,
}

impl Bot {
    pub fn new(name: impl Into<String>, config: BotConfig) -> Self {
        Self {
            name: name.into(),
            config,
            id: None,
            position: Position::new(0.0, 0.0),
            chunk: None,
            waypoint: None,
            peers: HashMap::new(),
            asteroids: Vec::new(),
            depleted: HashSet::new(),
            pvp_allowed: false,
            dead_until: None,
            move_cooldown_until: 0,
            auth_retry_at: None,
            counters: BotCounters::default(),
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_ready(&self) -> bool {
        self.id.is_some() && self.chunk.is_some()
    }

    pub fn is_dead(&self) -> bool {
        self.dead_until.is_some()
    }

    pub fn authenticate(&self) -> InboundEvent {
        InboundEvent::Authenticate {
            token: self.name.clone(),
        }
    }

    /// Updates the local model from one server event.
    pub fn apply(&mut self, event: &OutboundEvent, now: u64) -> Reaction {
        self.counters.received += 1;
        match event {
            OutboundEvent::AuthResult { ok: true, player_id, .. } => {
                self.id = *player_id;
            }
            OutboundEvent::AuthResult { ok: false, error, .. } => {
                return Reaction::Refused(error.clone().unwrap_or_else(|| "unknown".to_string()));
            }
            OutboundEvent::ChunkSnapshot {
                chunk,
                zone,
                content,
                other_players,
            } => {
                if self.chunk.is_none() {
                    // assume the chunk centre until a correction says otherwise
                    let corner = chunk.world_origin(self.config.chunk_size);
                    let half = self.config.chunk_size / 2.0;
                    self.position = Position::new(corner.x + half, corner.y + half);
                }
                if let Some(me) = self.id {
                    if let Some(peer) = other_players.iter().find(|p| p.id == me) {
                        self.position = Position::new(peer.x, peer.y);
                    }
                }
                self.chunk = Some(*chunk);
                self.pvp_allowed = zone.pvp_allowed;
                self.asteroids = content.clone();
                self.depleted.clear();
                self.peers = other_players
                    .iter()
                    .filter(|p| Some(p.id) != self.id)
                    .map(|p| (p.id, Position::new(p.x, p.y)))
                    .collect();
            }
            OutboundEvent::PositionCorrected { x, y, .. } => {
                self.counters.corrections += 1;
                self.position = Position::new(*x, *y);
                self.chunk = ChunkCoord::containing(self.position, self.config.chunk_size).or(self.chunk);
                self.waypoint = None;
            }
            OutboundEvent::PeerMoved { id, x, y } => {
                self.peers.insert(*id, Position::new(*x, *y));
            }
            OutboundEvent::PeerJoined { id, x, y, .. } => {
                if Some(*id) != self.id {
                    self.peers.insert(*id, Position::new(*x, *y));
                }
            }
            OutboundEvent::PeerLeft { id } => {
                self.peers.remove(id);
            }
            OutboundEvent::Hit {
                attacker_id,
                target_id,
                fatal,
                ..
            } => {
                if Some(*attacker_id) == self.id {
                    self.counters.hits_dealt += 1;
                    if *fatal {
                        self.counters.kills += 1;
                    }
                }
                if Some(*target_id) == self.id {
                    self.counters.hits_taken += 1;
                }
            }
            OutboundEvent::Death { respawn_delay_ms, .. } => {
                self.counters.deaths += 1;
                self.dead_until = Some(now + respawn_delay_ms);
                self.waypoint = None;
            }
            OutboundEvent::Respawned { x, y, .. } => {
                self.dead_until = None;
                self.position = Position::new(*x, *y);
                self.waypoint = None;
            }
            OutboundEvent::ActionRejected { .. } => {
                self.counters.rejections += 1;
            }
            OutboundEvent::RateLimited { retry_after_ms } => {
                self.counters.rate_limited += 1;
                if self.id.is_none() {
                    self.auth_retry_at = Some(now + retry_after_ms);
                } else {
                    self.move_cooldown_until = now + retry_after_ms;
                }
            }
            OutboundEvent::ResourceCollected { asteroid_id, amount, .. } => {
                self.counters.asteroids_mined += 1;
                self.counters.resources += amount;
                self.depleted.insert(*asteroid_id);
            }
            OutboundEvent::AsteroidDepleted { asteroid_id } => {
                self.depleted.insert(*asteroid_id);
            }
            OutboundEvent::Migrate { address, .. } => {
                self.counters.migrations += 1;
                return Reaction::Migrate {
                    address: address.clone(),
                };
            }
            OutboundEvent::SessionReplaced => return Reaction::Replaced,
            OutboundEvent::Stats { .. } => {}
        }
        Reaction::None
    }

    /// Forgets everything tied to the current connection, keeping the counters.
    pub fn reset_session(&mut self) {
        self.id = None;
        self.chunk = None;
        self.waypoint = None;
        self.peers.clear();
        self.asteroids.clear();
        self.depleted.clear();
        self.dead_until = None;
        self.move_cooldown_until = 0;
        self.auth_retry_at = None;
    }

    /// The login to resend, once a rate-limited attempt may be retried.
    pub fn retry_authentication(&mut self, now: u64) -> Option<InboundEvent> {
        match self.auth_retry_at {
            Some(at) if now >= at => {
                self.auth_retry_at = None;
                Some(self.authenticate())
            }
            _ => None,
        }
    }

    /// The respawn request, once the death timer has run out.
    pub fn respawn(&self, now: u64) -> Option<InboundEvent> {
        match self.dead_until {
            Some(at) if now >= at => Some(InboundEvent::Respawn),
            _ => None,
        }
    }

    /// Advances the random walk by `dt` seconds and returns the move to send.
    pub fn next_move(&mut self, dt: f64, now: u64, rng: &mut impl Rng) -> Option<InboundEvent> {
        if !self.is_ready() || self.is_dead() || now < self.move_cooldown_until {
            return None;
        }

        let waypoint = match self.waypoint {
            Some(w) if w.distance(self.position) > 1.0 => w,
            _ => {
                let angle = rng.gen_range(0.0..std::f64::consts::TAU);
                let reach = rng.gen_range(0.2..1.0) * self.config.wander_radius;
                let w = Position::new(
                    self.position.x + angle.cos() * reach,
                    self.position.y + angle.sin() * reach,
                );
                self.waypoint = Some(w);
                w
            }
        };

        let distance = waypoint.distance(self.position);
        let hop = (self.config.speed * dt).min(distance);
        if hop <= 0.0 {
            return None;
        }
        let next = Position::new(
            self.position.x + (waypoint.x - self.position.x) / distance * hop,
            self.position.y + (waypoint.y - self.position.y) / distance * hop,
        );
        let chunk = ChunkCoord::containing(next, self.config.chunk_size)?;
        self.position = next;
        self.chunk = Some(chunk);
        Some(InboundEvent::Move {
            x: next.x,
            y: next.y,
            chunk_x: Some(chunk.x),
            chunk_y: Some(chunk.y),
        })
    }

    /// An attack on the closest peer in range, when combat is allowed here.
    pub fn attack(&self) -> Option<InboundEvent> {
        if !self.is_ready() || self.is_dead() || !self.pvp_allowed {
            return None;
        }
        self.peers
            .iter()
            .map(|(id, at)| (*id, at.distance(self.position)))
            .filter(|(_, d)| *d <= self.config.attack_range)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(target_id, _)| InboundEvent::Attack { target_id })
    }

    /// Mines the closest asteroid in range, or heads for the closest one.
    pub fn mine(&mut self) -> Option<InboundEvent> {
        if !self.is_ready() || self.is_dead() {
            return None;
        }
        let closest = self
            .asteroids
            .iter()
            .filter(|a| !self.depleted.contains(&a.id))
            .min_by(|a, b| {
                a.position
                    .distance(self.position)
                    .total_cmp(&b.position.distance(self.position))
            })?;
        if closest.position.distance(self.position) <= self.config.mine_range {
            Some(InboundEvent::Mine {
                asteroid_id: closest.id,
            })
        } else {
            self.waypoint = Some(closest.position);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use starfall_core::{zone_for, PeerInfo, ResourceKind};

    fn logged_in(chunk: ChunkCoord, asteroids: Vec<Asteroid>, peers: Vec<PeerInfo>) -> Bot {
        let mut bot = Bot::new("vega", BotConfig::default());
        let me = PlayerId::from_account_name("vega");
        bot.apply(
            &OutboundEvent::AuthResult {
                ok: true,
                player_id: Some(me),
                error: None,
            },
            0,
        );
        bot.apply(
            &OutboundEvent::ChunkSnapshot {
                chunk,
                zone: zone_for(chunk),
                content: asteroids,
                other_players: peers,
            },
            0,
        );
        bot
    }

    fn asteroid(id: u32, x: f64, y: f64) -> Asteroid {
        Asteroid {
            id,
            position: Position::new(x, y),
            radius: 20.0,
            resource: ResourceKind::Iron,
            quantity: 10,
        }
    }

    #[test]
    fn random_walk_stays_under_the_speed_limit() {
        let mut bot = logged_in(ChunkCoord::ORIGIN, vec![], vec![]);
        let mut rng = StdRng::seed_from_u64(3);
        let mut last = bot.position();
        for step in 0..500u64 {
            let event = bot.next_move(0.1, step * 100, &mut rng).unwrap();
            let InboundEvent::Move { x, y, chunk_x, chunk_y } = event else {
                panic!("expected a move");
            };
            let now = Position::new(x, y);
            assert!(now.distance(last) <= 200.0 * 0.1 + 1e-9);
            assert_eq!(
                ChunkCoord::containing(now, 1000.0).map(|c| (c.x, c.y)),
                chunk_x.zip(chunk_y)
            );
            last = now;
        }
    }

    #[test]
    fn correction_snaps_back_and_rate_limit_pauses_moves() {
        let mut bot = logged_in(ChunkCoord::ORIGIN, vec![], vec![]);
        let mut rng = StdRng::seed_from_u64(1);
        bot.apply(
            &OutboundEvent::PositionCorrected {
                x: 120.0,
                y: 80.0,
                reason: "speed".into(),
            },
            0,
        );
        assert_eq!(bot.position(), Position::new(120.0, 80.0));
        assert_eq!(bot.counters.corrections, 1);

        bot.apply(&OutboundEvent::RateLimited { retry_after_ms: 500 }, 1_000);
        assert!(bot.next_move(0.1, 1_200, &mut rng).is_none());
        assert!(bot.next_move(0.1, 1_500, &mut rng).is_some());
        assert_eq!(bot.counters.rate_limited, 1);
    }

    #[test]
    fn attacks_only_in_pvp_zones_and_only_in_range() {
        let near = PeerInfo {
            id: PlayerId::from_account_name("orion"),
            name: "orion".into(),
            x: 60_600.0,
            y: 500.0,
            health: 100,
        };
        let far = PeerInfo {
            id: PlayerId::from_account_name("lyra"),
            x: 60_990.0,
            y: 990.0,
            name: "lyra".into(),
            health: 100,
        };

        let safe = logged_in(ChunkCoord::ORIGIN, vec![], vec![near.clone()]);
        assert!(safe.attack().is_none());

        let hostile = logged_in(ChunkCoord::new(60, 0), vec![], vec![near.clone(), far]);
        assert_eq!(hostile.position(), Position::new(60_500.0, 500.0));
        assert_eq!(hostile.attack(), Some(InboundEvent::Attack { target_id: near.id }));
    }

    #[test]
    fn mining_heads_for_the_closest_asteroid_first() {
        let mut bot = logged_in(
            ChunkCoord::ORIGIN,
            vec![asteroid(0, 900.0, 900.0), asteroid(1, 560.0, 500.0)],
            vec![],
        );
        assert_eq!(bot.mine(), Some(InboundEvent::Mine { asteroid_id: 1 }));

        bot.apply(&OutboundEvent::AsteroidDepleted { asteroid_id: 1 }, 0);
        assert_eq!(bot.mine(), None);
        assert_eq!(bot.waypoint, Some(Position::new(900.0, 900.0)));
    }

    #[test]
    fn rate_limited_login_is_retried_later() {
        let mut bot = Bot::new("vega", BotConfig::default());
        bot.apply(&OutboundEvent::RateLimited { retry_after_ms: 30_000 }, 1_000);
        assert!(bot.retry_authentication(20_000).is_none());
        assert_eq!(bot.retry_authentication(31_000), Some(bot.authenticate()));
        assert!(bot.retry_authentication(32_000).is_none());
    }

    #[test]
    fn death_blocks_actions_until_respawn() {
        let mut bot = logged_in(ChunkCoord::ORIGIN, vec![asteroid(0, 510.0, 500.0)], vec![]);
        let mut rng = StdRng::seed_from_u64(9);
        bot.apply(
            &OutboundEvent::Death {
                killer_id: PlayerId::from_account_name("orion"),
                respawn_delay_ms: 5_000,
            },
            1_000,
        );
        assert!(bot.next_move(0.1, 2_000, &mut rng).is_none());
        assert!(bot.mine().is_none());
        assert!(bot.respawn(5_999).is_none());
        assert_eq!(bot.respawn(6_000), Some(InboundEvent::Respawn));

        bot.apply(
            &OutboundEvent::Respawned {
                x: 500.0,
                y: 500.0,
                health: 100,
            },
            6_100,
        );
        assert!(!bot.is_dead());
        assert_eq!(bot.counters.deaths, 1);
    }

    #[test]
    fn migration_and_refusal_are_surfaced() {
        let mut bot = Bot::new("vega", BotConfig::default());
        assert_eq!(
            bot.apply(
                &OutboundEvent::Migrate {
                    instance_id: "b".into(),
                    address: "ws://b:8080".into()
                },
                0
            ),
            Reaction::Migrate {
                address: "ws://b:8080".into()
            }
        );
        assert_eq!(
            bot.apply(
                &OutboundEvent::AuthResult {
                    ok: false,
                    player_id: None,
                    error: Some("server_full".into())
                },
                0
            ),
            Reaction::Refused("server_full".into())
        );
        let mut total = BotCounters::default();
        total += bot.counters;
        total += bot.counters;
        assert_eq!(total.migrations, 2);
        assert_eq!(total.received, 4);
    }
}
