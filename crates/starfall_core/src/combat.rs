//! # Combat Resolver
//!
//! Validates and applies player-versus-player attacks and respawns.
//!
//! Each player is either alive or dead:
//!
//! ```text
//! Alive --(fatal hit)--> Dead --(respawn after delay)--> Alive
//! ```
//!
//! Every rejection is a typed reason and leaves all state untouched. Health is
//! only ever changed through the [`HotStateCache`].

use crate::persistence::BattleLogEntry;
use crate::state::HotStateCache;
use crate::types::{ChunkCoord, PlayerId, Position};
use crate::zone::{zone_for, ZoneTier};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Combat tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatConfig {
    /// Maximum attacker-defender distance in world units
    pub max_range: f64,
    /// Probability of a critical hit, `0.0..=1.0`
    pub crit_chance: f64,
    pub crit_multiplier: f64,
    pub respawn_delay_ms: u64,
    pub respawn_point: Position,
    pub respawn_chunk: ChunkCoord,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            max_range: 400.0,
            crit_chance: 0.1,
            crit_multiplier: 2.0,
            respawn_delay_ms: 5000,
            respawn_point: Position::new(500.0, 500.0),
            respawn_chunk: ChunkCoord::ORIGIN,
        }
    }
}

/// Why an attack was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttackRejection {
    UnknownAttacker,
    UnknownTarget,
    AttackerDead,
    SelfTarget,
    TargetDead,
    DifferentChunk,
    PvpDisabled { tier: ZoneTier },
    OutOfRange { distance: f64, max: f64 },
}

impl AttackRejection {
    pub fn code(&self) -> &'static str {
        match self {
            AttackRejection::UnknownAttacker => "unknown_attacker",
            AttackRejection::UnknownTarget => "unknown_target",
            AttackRejection::AttackerDead => "attacker_dead",
            AttackRejection::SelfTarget => "self_target",
            AttackRejection::TargetDead => "target_dead",
            AttackRejection::DifferentChunk => "different_chunk",
            AttackRejection::PvpDisabled { .. } => "pvp_disabled",
            AttackRejection::OutOfRange { .. } => "out_of_range",
        }
    }
}

impl fmt::Display for AttackRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttackRejection::PvpDisabled { tier } => write!(f, "PvP is disabled in {} zones", tier.name()),
            AttackRejection::OutOfRange { distance, max } => {
                write!(f, "target is {:.1} away, max range {:.1}", distance, max)
            }
            other => write!(f, "{}", other.code()),
        }
    }
}

/// Why a respawn was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RespawnRejection {
    UnknownPlayer,
    NotDead,
    NotReady { remaining_ms: u64 },
}

impl RespawnRejection {
    pub fn code(&self) -> &'static str {
        match self {
            RespawnRejection::UnknownPlayer => "unknown_player",
            RespawnRejection::NotDead => "not_dead",
            RespawnRejection::NotReady { .. } => "not_ready",
        }
    }
}

/// Life state of one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeState {
    Alive,
    Dead {
        killer: PlayerId,
        died_at: u64,
        respawn_at: u64,
    },
}

/// Everything a successful attack produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AttackOutcome {
    pub attacker: PlayerId,
    pub defender: PlayerId,
    pub damage: u32,
    pub is_critical: bool,
    pub health_before: u32,
    pub health_after: u32,
    pub fatal: bool,
    pub chunk: ChunkCoord,
    pub respawn_delay_ms: u64,
}

/// Where and how a player came back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RespawnOutcome {
    pub player: PlayerId,
    pub position: Position,
    pub chunk: ChunkCoord,
    pub health: u32,
}

/// Base damage before critical hits: `max(1, floor(weapon - armor / 2))`.
pub fn base_damage(weapon_power: u32, armor: u32) -> u32 {
    let raw = weapon_power as f64 - 0.5 * armor as f64;
    raw.floor().max(1.0) as u32
}

/// Damage after an optional critical multiplier, floored.
pub fn critical_damage(base: u32, multiplier: f64) -> u32 {
    ((base as f64) * multiplier).floor().max(1.0) as u32
}

/// Attack and respawn rules plus per-player life state.
#[derive(Debug, Default)]
pub struct CombatResolver {
    config: CombatConfig,
    life: HashMap<PlayerId, LifeState>,
}

impl CombatResolver {
    pub fn new(config: CombatConfig) -> Self {
        Self {
            config,
            life: HashMap::new(),
        }
    }

    pub fn config(&self) -> &CombatConfig {
        &self.config
    }

    pub fn life_state(&self, player: PlayerId) -> LifeState {
        self.life.get(&player).copied().unwrap_or(LifeState::Alive)
    }

    /// Resolves `attacker` hitting `defender`.
    pub fn resolve_attack<R: Rng + ?Sized>(
        &mut self,
        cache: &mut HotStateCache,
        attacker: PlayerId,
        defender: PlayerId,
        now: u64,
        rng: &mut R,
    ) -> Result<AttackOutcome, AttackRejection> {
        let attacker_state = cache
            .get(attacker)
            .filter(|p| p.online)
            .ok_or(AttackRejection::UnknownAttacker)?;
        if !attacker_state.is_alive() {
            return Err(AttackRejection::AttackerDead);
        }
        let defender_state = cache
            .get(defender)
            .filter(|p| p.online)
            .ok_or(AttackRejection::UnknownTarget)?;
        if attacker == defender {
            return Err(AttackRejection::SelfTarget);
        }
        if !defender_state.is_alive() {
            return Err(AttackRejection::TargetDead);
        }
        if attacker_state.chunk != defender_state.chunk {
            return Err(AttackRejection::DifferentChunk);
        }
        let zone = zone_for(attacker_state.chunk);
        if !zone.pvp_allowed {
            return Err(AttackRejection::PvpDisabled { tier: zone.tier });
        }
        let distance = attacker_state.position.distance(defender_state.position);
        if distance > self.config.max_range {
            return Err(AttackRejection::OutOfRange {
                distance,
                max: self.config.max_range,
            });
        }

        let chunk = attacker_state.chunk;
        let health_before = defender_state.health;
        let mut damage = base_damage(attacker_state.weapon_power, defender_state.armor);
        let is_critical = rng.gen::<f64>() < self.config.crit_chance;
        if is_critical {
            damage = critical_damage(damage, self.config.crit_multiplier);
        }

        let health_after = cache
            .apply_damage(defender, damage)
            .map_err(|_| AttackRejection::UnknownTarget)?;
        let fatal = health_after == 0;

        cache.record_battle(BattleLogEntry {
            attacker,
            defender,
            damage,
            critical: is_critical,
            fatal,
            health_before,
            health_after,
            chunk,
            timestamp: now,
        });

        if fatal {
            let respawn_at = now + self.config.respawn_delay_ms;
            self.life.insert(
                defender,
                LifeState::Dead {
                    killer: attacker,
                    died_at: now,
                    respawn_at,
                },
            );
            info!(
                attacker = %attacker,
                defender = %defender,
                "💀 Player killed in chunk {}",
                chunk
            );
        } else {
            debug!("⚔️ {} hit {} for {} (crit: {})", attacker, defender, damage, is_critical);
        }

        Ok(AttackOutcome {
            attacker,
            defender,
            damage,
            is_critical,
            health_before,
            health_after,
            fatal,
            chunk,
            respawn_delay_ms: self.config.respawn_delay_ms,
        })
    }

    /// Brings a dead player back at the respawn point once the delay passed.
    pub fn resolve_respawn(
        &mut self,
        cache: &mut HotStateCache,
        player: PlayerId,
        now: u64,
    ) -> Result<RespawnOutcome, RespawnRejection> {
        let state = cache
            .get(player)
            .filter(|p| p.online)
            .ok_or(RespawnRejection::UnknownPlayer)?;

        match self.life_state(player) {
            LifeState::Dead { respawn_at, .. } if now < respawn_at => {
                return Err(RespawnRejection::NotReady {
                    remaining_ms: respawn_at - now,
                });
            }
            LifeState::Dead { .. } => {}
            // a player restored from storage with zero health has no death record
            LifeState::Alive if state.health == 0 => {}
            LifeState::Alive => return Err(RespawnRejection::NotDead),
        }

        let position = self.config.respawn_point;
        let chunk = self.config.respawn_chunk;
        cache
            .restore(player, position, chunk)
            .map_err(|_| RespawnRejection::UnknownPlayer)?;
        self.life.remove(&player);
        let health = cache.get(player).map(|p| p.health).unwrap_or(0);

        info!("✨ Player {} respawned at ({}, {})", player, position.x, position.y);
        Ok(RespawnOutcome {
            player,
            position,
            chunk,
            health,
        })
    }

    /// Drops life state for a departing player.
    pub fn forget(&mut self, player: PlayerId) {
        self.life.remove(&player);
    }

    pub fn dead_count(&self) -> usize {
        self.life.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PlayerState;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Rng stand-in that always rolls the same value.
    struct FixedRoll(u64);

    impl rand::RngCore for FixedRoll {
        fn next_u32(&mut self) -> u32 {
            (self.0 >> 32) as u32
        }
        fn next_u64(&mut self) -> u64 {
            self.0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest.iter_mut() {
                *byte = self.0 as u8;
            }
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    const NEVER_CRIT: FixedRoll = FixedRoll(u64::MAX);
    const ALWAYS_CRIT: FixedRoll = FixedRoll(0);

    fn spawn(cache: &mut HotStateCache, name: &str, x: f64, y: f64) -> PlayerId {
        let id = PlayerId::from_account_name(name);
        let position = Position::new(x, y);
        let chunk = ChunkCoord::containing(position, 1000.0).unwrap();
        cache.upsert_on_connect(id, PlayerState::new(id, name, position, chunk, 0));
        id
    }

    #[test]
    fn test_damage_formula() {
        assert_eq!(base_damage(10, 4), 8);
        assert_eq!(base_damage(10, 5), 7);
        assert_eq!(base_damage(1, 50), 1);
        assert_eq!(critical_damage(8, 2.0), 16);
        assert_eq!(critical_damage(7, 1.5), 10);
    }

    #[test]
    fn test_hit_in_hostile_zone() {
        let mut cache = HotStateCache::default();
        let mut combat = CombatResolver::default();
        let a = spawn(&mut cache, "a", 60_100.0, 100.0);
        let b = spawn(&mut cache, "b", 60_200.0, 100.0);

        let outcome = combat
            .resolve_attack(&mut cache, a, b, 10, &mut NEVER_CRIT)
            .unwrap();
        assert_eq!(outcome.damage, 8);
        assert!(!outcome.is_critical);
        assert_eq!(outcome.health_after, 92);
        assert_eq!(cache.get(b).unwrap().health, 92);

        let outcome = combat
            .resolve_attack(&mut cache, a, b, 20, &mut ALWAYS_CRIT)
            .unwrap();
        assert_eq!(outcome.damage, 16);
        assert!(outcome.is_critical);
    }

    #[test]
    fn test_safe_zone_rejects_and_mutates_nothing() {
        let mut cache = HotStateCache::default();
        let mut combat = CombatResolver::default();
        let a = spawn(&mut cache, "a", 500.0, 500.0);
        let b = spawn(&mut cache, "b", 600.0, 500.0);
        let before = (cache.get(a).cloned(), cache.get(b).cloned());

        let rejection = combat
            .resolve_attack(&mut cache, a, b, 10, &mut StdRng::seed_from_u64(1))
            .unwrap_err();
        assert_eq!(rejection, AttackRejection::PvpDisabled { tier: ZoneTier::Safe });
        assert_eq!(before, (cache.get(a).cloned(), cache.get(b).cloned()));
    }

    #[test]
    fn test_validation_order() {
        let mut cache = HotStateCache::default();
        let mut combat = CombatResolver::default();
        let a = spawn(&mut cache, "a", 60_100.0, 100.0);
        let far = spawn(&mut cache, "far", 60_900.0, 100.0);
        let other_chunk = spawn(&mut cache, "other", 61_100.0, 100.0);
        let rng = &mut NEVER_CRIT;

        let ghost = PlayerId::new();
        assert_eq!(
            combat.resolve_attack(&mut cache, ghost, ghost, 0, rng).unwrap_err(),
            AttackRejection::UnknownAttacker
        );
        assert_eq!(
            combat.resolve_attack(&mut cache, a, ghost, 0, rng).unwrap_err(),
            AttackRejection::UnknownTarget
        );
        assert_eq!(
            combat.resolve_attack(&mut cache, a, a, 0, rng).unwrap_err(),
            AttackRejection::SelfTarget
        );
        assert_eq!(
            combat.resolve_attack(&mut cache, a, other_chunk, 0, rng).unwrap_err(),
            AttackRejection::DifferentChunk
        );
        assert_eq!(
            combat.resolve_attack(&mut cache, a, far, 0, rng).unwrap_err().code(),
            "out_of_range"
        );
    }

    #[test]
    fn test_death_and_respawn_cycle() {
        let mut cache = HotStateCache::default();
        let mut combat = CombatResolver::default();
        let a = spawn(&mut cache, "a", 60_100.0, 100.0);
        let b = spawn(&mut cache, "b", 60_150.0, 100.0);

        let mut last = None;
        for t in 0..20u64 {
            let outcome = combat.resolve_attack(&mut cache, a, b, t, &mut NEVER_CRIT).unwrap();
            if outcome.fatal {
                last = Some((t, outcome));
                break;
            }
        }
        let (died_at, outcome) = last.expect("defender should die");
        assert_eq!(outcome.health_after, 0);
        assert!(matches!(combat.life_state(b), LifeState::Dead { killer, .. } if killer == a));
        assert_eq!(
            combat.resolve_attack(&mut cache, a, b, died_at + 1, &mut NEVER_CRIT).unwrap_err(),
            AttackRejection::TargetDead
        );
        assert_eq!(
            combat.resolve_attack(&mut cache, b, a, died_at + 1, &mut NEVER_CRIT).unwrap_err(),
            AttackRejection::AttackerDead
        );

        assert_eq!(
            combat.resolve_respawn(&mut cache, b, died_at + 1000).unwrap_err(),
            RespawnRejection::NotReady { remaining_ms: 4000 }
        );
        let respawn = combat.resolve_respawn(&mut cache, b, died_at + 5000).unwrap();
        assert_eq!(respawn.position, Position::new(500.0, 500.0));
        assert_eq!(respawn.health, 100);
        assert_eq!(combat.life_state(b), LifeState::Alive);
        assert_eq!(
            combat.resolve_respawn(&mut cache, b, died_at + 6000).unwrap_err(),
            RespawnRejection::NotDead
        );
    }
}
