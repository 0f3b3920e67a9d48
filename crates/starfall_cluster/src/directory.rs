//! Player host claims.
//!
//! Each hosted player has a `player:host:{id}` key on the fabric naming the
//! instance that owns them. Claims carry the same TTL as instance records and
//! are refreshed with every heartbeat, so a crashed host's claims lapse on
//! their own.

use crate::fabric::Fabric;
use serde::{Deserialize, Serialize};
use starfall_core::utils::current_timestamp_ms;
use starfall_core::PlayerId;
use std::time::Duration;
use tracing::{debug, info};

pub fn host_key(player: PlayerId) -> String {
    format!("player:host:{player}")
}

/// Who hosts a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostClaim {
    pub instance_id: String,
    pub address: String,
    pub claimed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted,
    /// Another live instance holds the player
    HostedElsewhere(HostClaim),
}

#[derive(Debug, Clone)]
pub struct PlayerDirectory {
    fabric: Fabric,
    instance_id: String,
    address: String,
    ttl: Duration,
}

impl PlayerDirectory {
    pub fn new(fabric: Fabric, instance_id: impl Into<String>, address: impl Into<String>, ttl: Duration) -> Self {
        Self {
            fabric,
            instance_id: instance_id.into(),
            address: address.into(),
            ttl,
        }
    }

    /// Claims `player` for this instance unless another instance holds it.
    ///
    /// The check and the write are two fabric calls; two instances racing on
    /// the same player may both be granted, and the later write wins.
    pub async fn claim(&self, player: PlayerId) -> ClaimOutcome {
        if let Some(existing) = self.owner(player).await {
            if existing.instance_id != self.instance_id {
                info!(
                    "🔀 Player {} is hosted by instance {}, redirecting",
                    player, existing.instance_id
                );
                return ClaimOutcome::HostedElsewhere(existing);
            }
        }
        self.write_claim(player).await;
        ClaimOutcome::Granted
    }

    async fn write_claim(&self, player: PlayerId) {
        let claim = HostClaim {
            instance_id: self.instance_id.clone(),
            address: self.address.clone(),
            claimed_at: current_timestamp_ms(),
        };
        if let Err(e) = self.fabric.set_json(&host_key(player), &claim, self.ttl).await {
            debug!("Failed to encode host claim for {}: {}", player, e);
        }
    }

    /// Extends the TTL of every claim in `players`.
    pub async fn refresh(&self, players: &[PlayerId]) {
        for player in players {
            self.write_claim(*player).await;
        }
    }

    /// Drops the claim if this instance holds it.
    pub async fn release(&self, player: PlayerId) {
        match self.owner(player).await {
            Some(claim) if claim.instance_id == self.instance_id => {
                self.fabric.delete(&host_key(player)).await;
            }
            _ => {}
        }
    }

    pub async fn owner(&self, player: PlayerId) -> Option<HostClaim> {
        self.fabric.get_json(&host_key(player)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{FabricBackend, FabricConfig, MemoryBackend};
    use std::sync::Arc;

    fn pair() -> (PlayerDirectory, PlayerDirectory) {
        let shared: Arc<dyn FabricBackend> = Arc::new(MemoryBackend::default());
        let a = PlayerDirectory::new(
            Fabric::with_backend(Arc::clone(&shared), FabricConfig::default()),
            "a",
            "ws://a:8080",
            Duration::from_secs(15),
        );
        let b = PlayerDirectory::new(
            Fabric::with_backend(shared, FabricConfig::default()),
            "b",
            "ws://b:8080",
            Duration::from_secs(15),
        );
        (a, b)
    }

    #[tokio::test]
    async fn test_second_instance_is_redirected() {
        let (a, b) = pair();
        let player = PlayerId::from_account_name("vega");

        assert_eq!(a.claim(player).await, ClaimOutcome::Granted);
        // reclaiming our own player is fine
        assert_eq!(a.claim(player).await, ClaimOutcome::Granted);

        match b.claim(player).await {
            ClaimOutcome::HostedElsewhere(claim) => {
                assert_eq!(claim.instance_id, "a");
                assert_eq!(claim.address, "ws://a:8080");
            }
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_only_owner_can_release() {
        let (a, b) = pair();
        let player = PlayerId::from_account_name("orion");
        a.claim(player).await;

        b.release(player).await;
        assert!(a.owner(player).await.is_some());

        a.release(player).await;
        assert!(a.owner(player).await.is_none());
        assert_eq!(b.claim(player).await, ClaimOutcome::Granted);
    }
}
