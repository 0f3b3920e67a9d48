//! # Zone Rules
//!
//! Pure mapping from a chunk coordinate to its gameplay ruleset. Nothing is
//! stored: a [`ZoneDescriptor`] is recomputed whenever it is needed.
//!
//! | Tier | Name | Distance from origin | PvP | Density |
//! |------|------|----------------------|-----|---------|
//! | 0 | safe | `d < 20` | no | low |
//! | 1 | transition | `20 <= d < 50` | no | medium |
//! | 2 | hostile | `d >= 50` | yes | high |
//!
//! The loot multiplier grows linearly with distance and is capped at 5x.

use crate::types::ChunkCoord;
use serde::{Deserialize, Serialize};

/// Chunk distance at which the transition tier begins.
pub const TRANSITION_DISTANCE: f64 = 20.0;
/// Chunk distance at which the hostile tier begins.
pub const HOSTILE_DISTANCE: f64 = 50.0;
/// Upper bound for the loot multiplier.
pub const MAX_LOOT_MULTIPLIER: f64 = 5.0;
/// Distance (in chunks) that adds one whole unit to the loot multiplier.
const LOOT_DISTANCE_STEP: f64 = 25.0;

/// Gameplay tier of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneTier {
    Safe,
    Transition,
    Hostile,
}

impl ZoneTier {
    /// Numeric tier index (0, 1, 2).
    pub fn index(&self) -> u8 {
        match self {
            ZoneTier::Safe => 0,
            ZoneTier::Transition => 1,
            ZoneTier::Hostile => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ZoneTier::Safe => "safe",
            ZoneTier::Transition => "transition",
            ZoneTier::Hostile => "hostile",
        }
    }
}

/// How much content the generator places in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentDensity {
    Low,
    Medium,
    High,
}

impl ContentDensity {
    /// Inclusive range of content items generated for this density.
    pub fn item_range(&self) -> (u32, u32) {
        match self {
            ContentDensity::Low => (3, 6),
            ContentDensity::Medium => (6, 10),
            ContentDensity::High => (10, 16),
        }
    }
}

/// Visual/thematic biome of a zone, forwarded to clients with chunk snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Biome {
    InnerBelt,
    Frontier,
    DeepVoid,
}

/// Derived ruleset for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDescriptor {
    pub tier: ZoneTier,
    pub pvp_allowed: bool,
    pub loot_multiplier: f64,
    pub density: ContentDensity,
    pub biome: Biome,
    /// Distance from the origin chunk, in chunk units
    pub distance: f64,
}

/// Computes the zone descriptor of a chunk.
pub fn zone_for(coord: ChunkCoord) -> ZoneDescriptor {
    let distance = coord.distance_from_origin();
    let tier = tier_for_distance(distance);
    let (pvp_allowed, density, biome) = match tier {
        ZoneTier::Safe => (false, ContentDensity::Low, Biome::InnerBelt),
        ZoneTier::Transition => (false, ContentDensity::Medium, Biome::Frontier),
        ZoneTier::Hostile => (true, ContentDensity::High, Biome::DeepVoid),
    };

    ZoneDescriptor {
        tier,
        pvp_allowed,
        loot_multiplier: loot_multiplier(distance),
        density,
        biome,
        distance,
    }
}

/// Maps a distance from the origin chunk to a tier.
pub fn tier_for_distance(distance: f64) -> ZoneTier {
    if distance < TRANSITION_DISTANCE {
        ZoneTier::Safe
    } else if distance < HOSTILE_DISTANCE {
        ZoneTier::Transition
    } else {
        ZoneTier::Hostile
    }
}

/// Loot multiplier for a distance, linear and capped at [`MAX_LOOT_MULTIPLIER`].
pub fn loot_multiplier(distance: f64) -> f64 {
    (1.0 + distance.max(0.0) / LOOT_DISTANCE_STEP).min(MAX_LOOT_MULTIPLIER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(zone_for(ChunkCoord::new(0, 0)).tier, ZoneTier::Safe);
        assert_eq!(zone_for(ChunkCoord::new(19, 0)).tier, ZoneTier::Safe);
        assert_eq!(zone_for(ChunkCoord::new(20, 0)).tier, ZoneTier::Transition);
        assert_eq!(zone_for(ChunkCoord::new(0, -49)).tier, ZoneTier::Transition);
        assert_eq!(zone_for(ChunkCoord::new(-50, 0)).tier, ZoneTier::Hostile);
        // 30-40-50 triangle sits exactly on the hostile boundary
        assert_eq!(zone_for(ChunkCoord::new(30, 40)).tier, ZoneTier::Hostile);
    }

    #[test]
    fn test_only_hostile_allows_pvp() {
        assert!(!zone_for(ChunkCoord::new(5, 5)).pvp_allowed);
        assert!(!zone_for(ChunkCoord::new(25, 0)).pvp_allowed);
        assert!(zone_for(ChunkCoord::new(0, 75)).pvp_allowed);
    }

    #[test]
    fn test_loot_multiplier_is_linear_and_capped() {
        assert_eq!(loot_multiplier(0.0), 1.0);
        assert_eq!(loot_multiplier(25.0), 2.0);
        assert_eq!(loot_multiplier(50.0), 3.0);
        assert_eq!(loot_multiplier(100.0), MAX_LOOT_MULTIPLIER);
        assert_eq!(loot_multiplier(10_000.0), MAX_LOOT_MULTIPLIER);
    }

    #[test]
    fn test_density_follows_tier() {
        assert_eq!(zone_for(ChunkCoord::new(1, 1)).density, ContentDensity::Low);
        assert_eq!(zone_for(ChunkCoord::new(30, 0)).density, ContentDensity::Medium);
        assert_eq!(zone_for(ChunkCoord::new(90, 0)).density, ContentDensity::High);
    }
}
