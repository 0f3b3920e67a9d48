//! # Core Type Definitions
//!
//! Fundamental identifiers and spatial types shared by every Starfall component.
//!
//! ## Key Types
//!
//! - [`PlayerId`] - Unique identifier for a player
//! - [`ConnectionId`] - Transport-level handle for one client connection
//! - [`ChunkCoord`] - Integer address of a chunk in the unbounded 2D world
//! - [`Position`] - 2D world-space position with double precision
//!
//! ## Design Principles
//!
//! - **Type Safety**: Wrapper types prevent ID confusion (PlayerId vs ConnectionId)
//! - **Precision**: Double-precision floats for accurate large-world positioning
//! - **Serialization**: All types support JSON serialization for network transmission

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace used to derive stable player identifiers from account names.
const PLAYER_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_9b7d_4e58_a0c4_1d2b_3e4f_5a6b);

/// Unique identifier for a player in the game world.
///
/// A wrapper around UUID that keeps player ids from being confused with
/// other identifiers in the system.
///
/// # Examples
///
/// ```rust
/// use starfall_core::PlayerId;
///
/// let player_id = PlayerId::new();
/// let same = PlayerId::from_str(&player_id.to_string())?;
/// assert_eq!(player_id, same);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Creates a new random player ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives a stable player ID from an account name.
    ///
    /// The same name always maps to the same id, on every instance.
    pub fn from_account_name(name: &str) -> Self {
        Self(Uuid::new_v5(&PLAYER_NAMESPACE, name.as_bytes()))
    }

    /// Parses a player ID from a string representation.
    ///
    /// # Returns
    ///
    /// Returns `Ok(PlayerId)` if the string is a valid UUID, otherwise returns
    /// `Err(uuid::Error)` with details about the parsing failure.
    pub fn from_str(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::str::FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a single transport connection.
///
/// Connection ids are allocated by the transport and are only meaningful
/// inside the process that allocated them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Integer address of a chunk.
///
/// Chunk `(0, 0)` covers world coordinates `[0, chunk_size)` on both axes;
/// negative coordinates extend the world in the other direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    /// The origin chunk, centre of the safe zone.
    pub const ORIGIN: ChunkCoord = ChunkCoord { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns the chunk containing a world-space position.
    ///
    /// Non-finite input maps to `None`; so does a position whose chunk index
    /// would not fit in an `i32`.
    pub fn containing(position: Position, chunk_size: f64) -> Option<Self> {
        if !position.is_finite() || chunk_size.is_nan() || chunk_size <= 0.0 {
            return None;
        }
        let cx = (position.x / chunk_size).floor();
        let cy = (position.y / chunk_size).floor();
        let range = i32::MIN as f64..=i32::MAX as f64;
        if !range.contains(&cx) || !range.contains(&cy) {
            return None;
        }
        Some(Self::new(cx as i32, cy as i32))
    }

    /// Euclidean distance from the origin chunk, in chunk units.
    pub fn distance_from_origin(&self) -> f64 {
        let x = self.x as f64;
        let y = self.y as f64;
        (x * x + y * y).sqrt()
    }

    /// World-space position of this chunk's minimum corner.
    pub fn world_origin(&self, chunk_size: f64) -> Position {
        Position::new(self.x as f64 * chunk_size, self.y as f64 * chunk_size)
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A 2D position in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another position.
    pub fn distance(&self, other: Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_name_ids_are_stable() {
        let a = PlayerId::from_account_name("vega");
        let b = PlayerId::from_account_name("vega");
        let c = PlayerId::from_account_name("rigel");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_chunk_containing_handles_negative_coordinates() {
        let size = 1000.0;
        assert_eq!(ChunkCoord::containing(Position::new(0.0, 999.9), size), Some(ChunkCoord::new(0, 0)));
        assert_eq!(ChunkCoord::containing(Position::new(-0.1, 1000.0), size), Some(ChunkCoord::new(-1, 1)));
        assert_eq!(ChunkCoord::containing(Position::new(f64::NAN, 0.0), size), None);
        assert_eq!(ChunkCoord::containing(Position::new(1e300, 0.0), size), None);
    }

    #[test]
    fn test_distance_from_origin() {
        assert_eq!(ChunkCoord::new(3, 4).distance_from_origin(), 5.0);
        assert_eq!(ChunkCoord::ORIGIN.distance_from_origin(), 0.0);
    }
}
