//! Error types for the game server.

use starfall_cluster::FabricError;
use starfall_core::StoreError;

/// Enumeration of possible server errors.
///
/// Gameplay rejections are not errors; they are answered to the client as
/// typed rejection events. These cover infrastructure only.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding failures or connection issues
    #[error("Network error: {0}")]
    Network(String),

    /// The world loop is gone or a component misbehaved
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),
}
