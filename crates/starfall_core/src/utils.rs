//! # Utility Functions
//!
//! Timestamp helpers used across the workspace. Every component that stamps
//! state (movement samples, chunk access, battle logs, heartbeats) goes
//! through these so all timestamps share one clock and one unit.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// A clock set before the Unix epoch yields `0` rather than panicking.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    current_timestamp_ms() / 1000
}
