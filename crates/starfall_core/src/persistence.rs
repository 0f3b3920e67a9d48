//! # Durable Store Boundary
//!
//! The hot state cache and chunk manager never talk to storage directly; they
//! hand rows to a [`DurableStore`]. The store contract is deliberately small:
//!
//! - players are **upserted by id** (idempotent, last write wins),
//! - battle log entries and chunk records are **append-only**,
//! - nothing is ever deleted. Going offline is an upsert with `online = false`.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and local
//! runs, and [`JsonFileStore`] which keeps a JSON snapshot of player rows and
//! JSON-lines logs for the append-only tables.

use crate::types::{ChunkCoord, PlayerId};
use crate::zone::ZoneTier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Errors raised by durable store implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persisted form of a player row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub chunk: ChunkCoord,
    pub health: u32,
    pub max_health: u32,
    pub resources: u64,
    pub armor: u32,
    pub weapon_power: u32,
    pub online: bool,
    pub updated_at: u64,
}

/// Immutable record of one resolved attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleLogEntry {
    pub attacker: PlayerId,
    pub defender: PlayerId,
    pub damage: u32,
    pub critical: bool,
    pub fatal: bool,
    pub health_before: u32,
    pub health_after: u32,
    pub chunk: ChunkCoord,
    pub timestamp: u64,
}

/// Append-only record written the first time a chunk is generated in a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub coord: ChunkCoord,
    pub seed: String,
    pub seed_hash: u64,
    pub tier: ZoneTier,
    pub asteroid_count: usize,
    pub generated_at: u64,
}

/// Storage collaborator used by the flush path.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Inserts or replaces player rows by id.
    async fn upsert_players(&self, records: &[PlayerRecord]) -> Result<(), StoreError>;

    /// Loads a single player row.
    async fn load_player(&self, id: PlayerId) -> Result<Option<PlayerRecord>, StoreError>;

    /// Appends battle log entries.
    async fn append_battle_log(&self, entries: &[BattleLogEntry]) -> Result<(), StoreError>;

    /// Appends chunk generation records.
    async fn append_chunks(&self, records: &[ChunkRecord]) -> Result<(), StoreError>;
}

/// In-process store. Writes can be made to fail on demand, which the flush
/// retry tests rely on.
#[derive(Debug, Default)]
pub struct MemoryStore {
    players: Mutex<HashMap<PlayerId, PlayerRecord>>,
    battle_log: Mutex<Vec<BattleLogEntry>>,
    chunks: Mutex<Vec<ChunkRecord>>,
    failing: AtomicBool,
    upsert_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Number of successful `upsert_players` calls.
    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::Relaxed)
    }

    pub async fn player(&self, id: PlayerId) -> Option<PlayerRecord> {
        self.players.lock().await.get(&id).cloned()
    }

    pub async fn battle_log(&self) -> Vec<BattleLogEntry> {
        self.battle_log.lock().await.clone()
    }

    pub async fn chunk_records(&self) -> Vec<ChunkRecord> {
        self.chunks.lock().await.clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert_players(&self, records: &[PlayerRecord]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut players = self.players.lock().await;
        for record in records {
            players.insert(record.id, record.clone());
        }
        self.upsert_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load_player(&self, id: PlayerId) -> Result<Option<PlayerRecord>, StoreError> {
        self.check_available()?;
        Ok(self.players.lock().await.get(&id).cloned())
    }

    async fn append_battle_log(&self, entries: &[BattleLogEntry]) -> Result<(), StoreError> {
        self.check_available()?;
        self.battle_log.lock().await.extend_from_slice(entries);
        Ok(())
    }

    async fn append_chunks(&self, records: &[ChunkRecord]) -> Result<(), StoreError> {
        self.check_available()?;
        self.chunks.lock().await.extend_from_slice(records);
        Ok(())
    }
}

const PLAYERS_FILE: &str = "players.json";
const BATTLE_LOG_FILE: &str = "battle_log.jsonl";
const CHUNKS_FILE: &str = "chunks.jsonl";

/// File-backed store rooted at a data directory.
///
/// Layout:
///
/// ```text
/// <data_dir>/players.json      array of PlayerRecord, rewritten on upsert
/// <data_dir>/battle_log.jsonl  one BattleLogEntry per line
/// <data_dir>/chunks.jsonl      one ChunkRecord per line
/// ```
///
/// The player snapshot is written to a temporary file and renamed into place so
/// a crash mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    players: Mutex<HashMap<PlayerId, PlayerRecord>>,
}

impl JsonFileStore {
    /// Opens (or creates) a store in `dir`, loading any existing player snapshot.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let snapshot = dir.join(PLAYERS_FILE);
        let players = match tokio::fs::read_to_string(&snapshot).await {
            Ok(content) if !content.trim().is_empty() => {
                let rows: Vec<PlayerRecord> = serde_json::from_str(&content)?;
                rows.into_iter().map(|row| (row.id, row)).collect()
            }
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!("💾 Opened file store at {} ({} player rows)", dir.display(), players.len());

        Ok(Self {
            dir,
            players: Mutex::new(players),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append_lines<T: Serialize>(&self, file: &str, rows: &[T]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut buffer = String::new();
        for row in rows {
            buffer.push_str(&serde_json::to_string(row)?);
            buffer.push('\n');
        }
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        handle.write_all(buffer.as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }

    async fn read_lines<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Result<Vec<T>, StoreError> {
        let content = match tokio::fs::read_to_string(self.dir.join(file)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }

    /// Reads back every battle log entry.
    pub async fn battle_log(&self) -> Result<Vec<BattleLogEntry>, StoreError> {
        self.read_lines(BATTLE_LOG_FILE).await
    }

    /// Reads back every chunk record.
    pub async fn chunk_records(&self) -> Result<Vec<ChunkRecord>, StoreError> {
        self.read_lines(CHUNKS_FILE).await
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    async fn upsert_players(&self, records: &[PlayerRecord]) -> Result<(), StoreError> {
        let mut players = self.players.lock().await;
        let mut next = players.clone();
        for record in records {
            next.insert(record.id, record.clone());
        }

        let mut rows: Vec<&PlayerRecord> = next.values().collect();
        rows.sort_by_key(|row| row.id);
        let json = serde_json::to_string_pretty(&rows)?;
        let target = self.dir.join(PLAYERS_FILE);
        let temp = self.dir.join(format!("{PLAYERS_FILE}.tmp"));
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &target).await?;

        // only commit the in-memory view once the file is in place
        *players = next;
        debug!("💾 Upserted {} player rows", records.len());
        Ok(())
    }

    async fn load_player(&self, id: PlayerId) -> Result<Option<PlayerRecord>, StoreError> {
        Ok(self.players.lock().await.get(&id).cloned())
    }

    async fn append_battle_log(&self, entries: &[BattleLogEntry]) -> Result<(), StoreError> {
        self.append_lines(BATTLE_LOG_FILE, entries).await
    }

    async fn append_chunks(&self, records: &[ChunkRecord]) -> Result<(), StoreError> {
        self.append_lines(CHUNKS_FILE, records).await
    }
}
