//! Deterministic seeded random sequence.
//!
//! Procedural content must be identical on every instance and every restart,
//! so generation never touches a thread RNG. A string seed is hashed with
//! 64-bit FNV-1a and the hash seeds a [`ChaCha8Rng`], whose output stream is
//! reproducible across platforms and builds.

use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hashes a string seed with 64-bit FNV-1a.
pub fn hash_seed(seed: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in seed.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The repeatable sequence for a string seed.
pub fn seeded_rng(seed: &str) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(hash_seed(seed))
}

/// Float in `[min, max)`, or `min` when the range is empty.
pub fn range_f64<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max > min {
        rng.gen_range(min..max)
    } else {
        min
    }
}

/// Picks an index according to relative weights. Returns `None` when every
/// weight is zero or the slice is empty.
pub fn pick_weighted<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> Option<usize> {
    let clamped: Vec<f64> = weights.iter().map(|w| if w.is_finite() { w.max(0.0) } else { 0.0 }).collect();
    WeightedIndex::new(&clamped).ok().map(|index| index.sample(rng))
}
