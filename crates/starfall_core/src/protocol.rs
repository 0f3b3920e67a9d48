//! # Wire Protocol
//!
//! JSON envelopes exchanged with clients, tagged by a `"type"` field.
//!
//! ```json
//! {"type": "move", "x": 512.0, "y": 498.5}
//! {"type": "hit", "attacker_id": "...", "target_id": "...", "damage": 8, ...}
//! ```
//!
//! Inbound messages are parsed into the closed [`InboundEvent`] enum at the
//! connection boundary; anything that does not fit is rejected before it
//! reaches the world loop.

use crate::generator::Asteroid;
use crate::rate_limiter::RateEvent;
use crate::types::{ChunkCoord, PlayerId};
use crate::zone::ZoneDescriptor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest accepted inbound text frame, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Errors raised while decoding inbound messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Both chunk_x and chunk_y must be given together")]
    PartialChunk,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Authenticate {
        token: String,
    },
    EnterChunk {
        chunk_x: i32,
        chunk_y: i32,
    },
    Move {
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_x: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_y: Option<i32>,
    },
    Attack {
        target_id: PlayerId,
    },
    Respawn,
    Mine {
        asteroid_id: u32,
    },
    Disconnect {
        #[serde(default)]
        reason: Option<String>,
    },
    Stats,
}

impl InboundEvent {
    /// Parses and validates one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }
        let event: InboundEvent = serde_json::from_str(text)?;
        if let InboundEvent::Move { chunk_x, chunk_y, .. } = &event {
            if chunk_x.is_some() != chunk_y.is_some() {
                return Err(ProtocolError::PartialChunk);
            }
        }
        Ok(event)
    }

    /// The chunk a move claims to land in, if any.
    pub fn claimed_chunk(&self) -> Option<ChunkCoord> {
        match self {
            InboundEvent::Move {
                chunk_x: Some(x),
                chunk_y: Some(y),
                ..
            } => Some(ChunkCoord::new(*x, *y)),
            _ => None,
        }
    }

    /// Rate limit bucket of this event. `None` for events that are never limited.
    pub fn rate_event(&self) -> Option<RateEvent> {
        match self {
            InboundEvent::Authenticate { .. } => Some(RateEvent::Authenticate),
            InboundEvent::EnterChunk { .. } => Some(RateEvent::EnterChunk),
            InboundEvent::Move { .. } => Some(RateEvent::Move),
            InboundEvent::Attack { .. } => Some(RateEvent::Attack),
            InboundEvent::Respawn => Some(RateEvent::Respawn),
            InboundEvent::Mine { .. } => Some(RateEvent::Mine),
            InboundEvent::Stats => Some(RateEvent::Stats),
            InboundEvent::Disconnect { .. } => None,
        }
    }

    /// Short name used in logs and `action_rejected` payloads.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Authenticate { .. } => "authenticate",
            InboundEvent::EnterChunk { .. } => "enter_chunk",
            InboundEvent::Move { .. } => "move",
            InboundEvent::Attack { .. } => "attack",
            InboundEvent::Respawn => "respawn",
            InboundEvent::Mine { .. } => "mine",
            InboundEvent::Disconnect { .. } => "disconnect",
            InboundEvent::Stats => "stats",
        }
    }
}

/// Public view of another player, as sent in snapshots and join events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PlayerId,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub health: u32,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    AuthResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_id: Option<PlayerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ChunkSnapshot {
        chunk: ChunkCoord,
        zone: ZoneDescriptor,
        content: Vec<Asteroid>,
        other_players: Vec<PeerInfo>,
    },
    PositionCorrected {
        x: f64,
        y: f64,
        reason: String,
    },
    PeerMoved {
        id: PlayerId,
        x: f64,
        y: f64,
    },
    PeerJoined {
        id: PlayerId,
        name: String,
        x: f64,
        y: f64,
        health: u32,
    },
    PeerLeft {
        id: PlayerId,
    },
    Hit {
        attacker_id: PlayerId,
        target_id: PlayerId,
        damage: u32,
        is_critical: bool,
        health: u32,
        fatal: bool,
    },
    Death {
        killer_id: PlayerId,
        respawn_delay_ms: u64,
    },
    Respawned {
        x: f64,
        y: f64,
        health: u32,
    },
    ActionRejected {
        action: String,
        reason: String,
    },
    RateLimited {
        retry_after_ms: u64,
    },
    ResourceCollected {
        asteroid_id: u32,
        amount: u64,
        total: u64,
    },
    AsteroidDepleted {
        asteroid_id: u32,
    },
    Migrate {
        instance_id: String,
        address: String,
    },
    SessionReplaced,
    Stats {
        stats: serde_json::Value,
    },
}

impl OutboundEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn rejected(action: &str, reason: impl Into<String>) -> Self {
        OutboundEvent::ActionRejected {
            action: action.to_string(),
            reason: reason.into(),
        }
    }

    /// Event type name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::AuthResult { .. } => "auth_result",
            OutboundEvent::ChunkSnapshot { .. } => "chunk_snapshot",
            OutboundEvent::PositionCorrected { .. } => "position_corrected",
            OutboundEvent::PeerMoved { .. } => "peer_moved",
            OutboundEvent::PeerJoined { .. } => "peer_joined",
            OutboundEvent::PeerLeft { .. } => "peer_left",
            OutboundEvent::Hit { .. } => "hit",
            OutboundEvent::Death { .. } => "death",
            OutboundEvent::Respawned { .. } => "respawned",
            OutboundEvent::ActionRejected { .. } => "action_rejected",
            OutboundEvent::RateLimited { .. } => "rate_limited",
            OutboundEvent::ResourceCollected { .. } => "resource_collected",
            OutboundEvent::AsteroidDepleted { .. } => "asteroid_depleted",
            OutboundEvent::Migrate { .. } => "migrate",
            OutboundEvent::SessionReplaced => "session_replaced",
            OutboundEvent::Stats { .. } => "stats",
        }
    }
}
