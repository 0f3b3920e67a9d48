//! # Shared State Fabric
//!
//! Key/value with TTLs plus publish/subscribe, shared by every instance of the
//! cluster. The fabric is the only channel through which instances learn
//! about each other.
//!
//! ## Degraded Mode
//!
//! Remote calls run under a bounded command timeout. When one fails or times
//! out the fabric switches to degraded mode and serves every call from an
//! in-process map. Callers never see an error for remote unavailability;
//! they only lose cross-instance visibility. A reconnect probe runs at most
//! once per `retry_interval`, and on success remote mode resumes.
//!
//! Writes are always mirrored to the local map, so anything this instance set
//! before an outage is still readable during it.
//!
//! ## Backends
//!
//! - [`MemoryBackend`]: in-process, TTL aware, broadcast based pub/sub. Used
//!   standalone and as a shared "remote" between fabrics in tests.
//! - [`RedisBackend`]: a Redis server, with pub/sub forwarded from a
//!   dedicated connection.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use starfall_core::utils::current_timestamp_ms;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Errors raised by fabric backends.
///
/// [`Fabric`] itself absorbs these and falls back to local mode.
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Remote store contract.
#[async_trait]
pub trait FabricBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), FabricError>;

    async fn get(&self, key: &str) -> Result<Option<String>, FabricError>;

    async fn delete(&self, key: &str) -> Result<(), FabricError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), FabricError>;

    /// Starts forwarding messages published on `channel` into `sink`.
    ///
    /// Forwarding stops on its own once `sink` has no receivers left.
    async fn subscribe(&self, channel: &str, sink: broadcast::Sender<String>) -> Result<(), FabricError>;

    async fn ping(&self) -> Result<(), FabricError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<u64>,
}

/// In-process backend with TTL-aware keys and broadcast channels.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: DashMap<String, StoredValue>,
    channels: DashMap<String, broadcast::Sender<String>>,
    channel_capacity: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryBackend {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            channels: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn channel(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }

    fn set_local(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(current_timestamp_ms().saturating_add(ttl.as_millis() as u64))
        };
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    fn get_local(&self, key: &str) -> Option<String> {
        let now = current_timestamp_ms();
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.expires_at {
                Some(at) if now >= at => true,
                _ => return Some(entry.value.clone()),
            },
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn publish_local(&self, channel: &str, message: &str) -> usize {
        self.channel(channel).send(message.to_string()).unwrap_or(0)
    }

    /// Removes expired keys. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = current_timestamp_ms();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| now < at));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FabricBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), FabricError> {
        self.set_local(key, value, ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, FabricError> {
        Ok(self.get_local(key))
    }

    async fn delete(&self, key: &str) -> Result<(), FabricError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), FabricError> {
        self.publish_local(channel, message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, sink: broadcast::Sender<String>) -> Result<(), FabricError> {
        let mut receiver = self.channel(channel).subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if sink.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Fabric subscriber lagged, skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), FabricError> {
        Ok(())
    }
}

/// Redis-backed fabric store.
pub struct RedisBackend {
    client: redis::Client,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
    subscribed: Arc<DashMap<String, ()>>,
    resubscribe_interval: Duration,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("subscribed", &self.subscribed.len())
            .finish()
    }
}

impl RedisBackend {
    /// Creates a backend for `url`. No connection is made until first use.
    pub fn new(url: &str, resubscribe_interval: Duration) -> Result<Self, FabricError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            subscribed: Arc::new(DashMap::new()),
            resubscribe_interval,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, FabricError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }
        let connection = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Drops the cached connection so the next command reconnects.
    async fn reset(&self) {
        *self.connection.lock().await = None;
    }

    async fn run<T, F, Fut>(&self, command: F) -> Result<T, FabricError>
    where
        F: FnOnce(redis::aio::MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let connection = self.connection().await?;
        match command(connection).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.reset().await;
                Err(e.into())
            }
        }
    }

    async fn forward(client: &redis::Client, channel: &str, sink: &broadcast::Sender<String>) -> Result<(), FabricError> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = message.get_payload()?;
            if sink.send(payload).is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FabricBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), FabricError> {
        let key = key.to_string();
        let value = value.to_string();
        let ttl_ms = ttl.as_millis() as u64;
        self.run(|mut con| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(&value);
            if ttl_ms > 0 {
                cmd.arg("PX").arg(ttl_ms);
            }
            let _: () = cmd.query_async(&mut con).await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, FabricError> {
        let key = key.to_string();
        self.run(|mut con| async move {
            let value: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut con).await?;
            Ok(value)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), FabricError> {
        let key = key.to_string();
        self.run(|mut con| async move {
            let _: () = redis::cmd("DEL").arg(&key).query_async(&mut con).await?;
            Ok(())
        })
        .await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), FabricError> {
        let channel = channel.to_string();
        let message = message.to_string();
        self.run(|mut con| async move {
            let _: () = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(&message)
                .query_async(&mut con)
                .await?;
            Ok(())
        })
        .await
    }

    async fn subscribe(&self, channel: &str, sink: broadcast::Sender<String>) -> Result<(), FabricError> {
        if self.subscribed.contains_key(channel) {
            return Ok(());
        }
        // fail fast so the fabric can fall back if Redis is down right now
        let mut probe = self.client.get_async_pubsub().await?;
        probe.subscribe(channel).await?;
        drop(probe);

        self.subscribed.insert(channel.to_string(), ());
        let client = self.client.clone();
        let channel = channel.to_string();
        let subscribed = Arc::clone(&self.subscribed);
        let retry = self.resubscribe_interval;

        tokio::spawn(async move {
            while sink.receiver_count() > 0 {
                match Self::forward(&client, &channel, &sink).await {
                    Ok(()) => debug!("📡 Redis subscription to {} ended", channel),
                    Err(e) => warn!("⚠️ Redis subscription to {} dropped: {}", channel, e),
                }
                if sink.receiver_count() == 0 {
                    break;
                }
                tokio::time::sleep(retry).await;
            }
            subscribed.remove(&channel);
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), FabricError> {
        self.run(|mut con| async move {
            let _: String = redis::cmd("PING").query_async(&mut con).await?;
            Ok(())
        })
        .await
    }
}

/// Fabric tunables.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Upper bound for any single remote call
    pub command_timeout: Duration,
    /// Minimum spacing between reconnect probes while degraded
    pub retry_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(500),
            retry_interval: Duration::from_secs(5),
            channel_capacity: 1024,
        }
    }
}

/// Which store is answering calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FabricMode {
    /// No remote configured
    Local,
    Remote,
    /// Remote configured but unreachable
    Degraded,
}

/// Fabric counters for stats snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    pub mode: FabricMode,
    pub hits: u64,
    pub misses: u64,
    pub remote_errors: u64,
    pub fallback_operations: u64,
}

struct FabricInner {
    remote: Option<Arc<dyn FabricBackend>>,
    local: MemoryBackend,
    config: FabricConfig,
    degraded: AtomicBool,
    last_probe_ms: AtomicU64,
    probe_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    remote_errors: AtomicU64,
    fallback_operations: AtomicU64,
    /// Per-channel fan-out to local subscribers
    channels: DashMap<String, broadcast::Sender<String>>,
    /// Channels whose remote forwarding is established
    remote_channels: DashMap<String, ()>,
}

/// Handle to the shared state fabric. Cheap to clone.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric").field("stats", &self.stats()).finish()
    }
}

impl Fabric {
    /// A fabric with no remote: single-instance mode.
    pub fn local(config: FabricConfig) -> Self {
        Self::build(None, config)
    }

    /// A fabric backed by `remote`, with local fallback.
    pub fn with_backend(remote: Arc<dyn FabricBackend>, config: FabricConfig) -> Self {
        Self::build(Some(remote), config)
    }

    /// Connects to Redis at `url`. An unreachable server starts the fabric in
    /// degraded mode; only a malformed URL is an error.
    pub async fn connect_redis(url: &str, config: FabricConfig) -> Result<Self, FabricError> {
        let backend = RedisBackend::new(url, config.retry_interval)?;
        let fabric = Self::with_backend(Arc::new(backend), config);
        if fabric.remote_call(|remote| async move { remote.ping().await }).await.is_some() {
            info!("🔗 Shared state fabric connected to Redis");
        } else {
            warn!("⚠️ Redis unreachable at startup, fabric running in local fallback mode");
        }
        Ok(fabric)
    }

    fn build(remote: Option<Arc<dyn FabricBackend>>, config: FabricConfig) -> Self {
        let local = MemoryBackend::new(config.channel_capacity);
        Self {
            inner: Arc::new(FabricInner {
                remote,
                local,
                config,
                degraded: AtomicBool::new(false),
                last_probe_ms: AtomicU64::new(0),
                probe_lock: Mutex::new(()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                remote_errors: AtomicU64::new(0),
                fallback_operations: AtomicU64::new(0),
                channels: DashMap::new(),
                remote_channels: DashMap::new(),
            }),
        }
    }

    pub fn mode(&self) -> FabricMode {
        match (&self.inner.remote, self.inner.degraded.load(Ordering::Acquire)) {
            (None, _) => FabricMode::Local,
            (Some(_), false) => FabricMode::Remote,
            (Some(_), true) => FabricMode::Degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.mode() == FabricMode::Degraded
    }

    pub fn stats(&self) -> FabricStats {
        FabricStats {
            mode: self.mode(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            remote_errors: self.inner.remote_errors.load(Ordering::Relaxed),
            fallback_operations: self.inner.fallback_operations.load(Ordering::Relaxed),
        }
    }

    /// Stores `value` under `key` for `ttl` (zero means no expiry).
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) {
        self.inner.local.set_local(key, value, ttl);
        let done = self
            .remote_call(|remote| {
                let key = key.to_string();
                let value = value.to_string();
                async move { remote.set_with_ttl(&key, &value, ttl).await }
            })
            .await;
        self.note_fallback(done.is_none());
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let remote = self
            .remote_call(|remote| {
                let key = key.to_string();
                async move { remote.get(&key).await }
            })
            .await;
        let value = match remote {
            Some(value) => value,
            None => {
                self.note_fallback(true);
                self.inner.local.get_local(key)
            }
        };
        let counter = if value.is_some() { &self.inner.hits } else { &self.inner.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    pub async fn delete(&self, key: &str) {
        self.inner.local.entries.remove(key);
        let done = self
            .remote_call(|remote| {
                let key = key.to_string();
                async move { remote.delete(&key).await }
            })
            .await;
        self.note_fallback(done.is_none());
    }

    /// Publishes `message` on `channel`. While the remote is healthy the
    /// message travels through it (and comes back to local subscribers the
    /// same way); otherwise it is delivered to local subscribers only.
    pub async fn publish(&self, channel: &str, message: &str) {
        let forwarded = self.inner.remote_channels.contains_key(channel);
        let done = self
            .remote_call(|remote| {
                let channel = channel.to_string();
                let message = message.to_string();
                async move { remote.publish(&channel, &message).await }
            })
            .await;

        if done.is_none() || !forwarded {
            self.note_fallback(done.is_none());
            if let Some(sender) = self.inner.channels.get(channel) {
                let _ = sender.send(message.to_string());
            }
        }
    }

    /// Subscribes to `channel`.
    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let sender = self.channel_sender(channel);
        let receiver = sender.subscribe();
        self.ensure_remote_subscription(channel, sender).await;
        receiver
    }

    /// Serializes `value` as JSON and stores it.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), FabricError> {
        let json = serde_json::to_string(value)?;
        self.set_with_ttl(key, &json, ttl).await;
        Ok(())
    }

    /// Reads and deserializes a JSON value. Undecodable values read as absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("⚠️ Ignoring undecodable fabric value at {}: {}", key, e);
                None
            }
        }
    }

    pub async fn publish_json<T: Serialize>(&self, channel: &str, value: &T) -> Result<(), FabricError> {
        let json = serde_json::to_string(value)?;
        self.publish(channel, &json).await;
        Ok(())
    }

    /// Drops expired keys from the local mirror. Returns how many.
    pub fn purge_expired(&self) -> usize {
        self.inner.local.purge_expired()
    }

    /// Number of keys held in the local mirror, expired ones included.
    pub fn local_len(&self) -> usize {
        self.inner.local.len()
    }

    /// Forces a reconnect probe regardless of the retry interval.
    pub async fn probe_now(&self) -> bool {
        self.inner.last_probe_ms.store(0, Ordering::Release);
        self.active_remote().await.is_some()
    }

    fn channel_sender(&self, channel: &str) -> broadcast::Sender<String> {
        let capacity = self.inner.config.channel_capacity.max(1);
        self.inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .clone()
    }

    async fn ensure_remote_subscription(&self, channel: &str, sender: broadcast::Sender<String>) {
        if self.inner.remote_channels.contains_key(channel) {
            return;
        }
        let established = self
            .remote_call(|remote| {
                let channel = channel.to_string();
                async move { remote.subscribe(&channel, sender).await }
            })
            .await;
        if established.is_some() {
            self.inner.remote_channels.insert(channel.to_string(), ());
            debug!("📡 Subscribed to fabric channel {}", channel);
        }
    }

    fn note_fallback(&self, fell_back: bool) {
        if fell_back && self.inner.remote.is_some() {
            self.inner.fallback_operations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Runs one remote call under the command timeout. `None` means the call
    /// was not made or failed, and the caller should serve it locally.
    async fn remote_call<T, F, Fut>(&self, op: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn FabricBackend>) -> Fut,
        Fut: Future<Output = Result<T, FabricError>>,
    {
        let remote = self.active_remote().await?;
        let timeout = self.inner.config.command_timeout;
        match tokio::time::timeout(timeout, op(remote)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.enter_degraded(&e.to_string());
                None
            }
            Err(_) => {
                self.enter_degraded(&FabricError::Timeout(timeout).to_string());
                None
            }
        }
    }

    /// The remote backend if it is usable right now, probing it when due.
    async fn active_remote(&self) -> Option<Arc<dyn FabricBackend>> {
        let remote = self.inner.remote.as_ref()?;
        if !self.inner.degraded.load(Ordering::Acquire) {
            return Some(Arc::clone(remote));
        }

        let now = current_timestamp_ms();
        let retry_ms = self.inner.config.retry_interval.as_millis() as u64;
        if now.saturating_sub(self.inner.last_probe_ms.load(Ordering::Acquire)) < retry_ms {
            return None;
        }

        // one probe at a time; everyone else stays local meanwhile
        let _guard = self.inner.probe_lock.try_lock().ok()?;
        if !self.inner.degraded.load(Ordering::Acquire) {
            return Some(Arc::clone(remote));
        }
        self.inner.last_probe_ms.store(now, Ordering::Release);

        let timeout = self.inner.config.command_timeout;
        match tokio::time::timeout(timeout, remote.ping()).await {
            Ok(Ok(())) => {
                self.inner.degraded.store(false, Ordering::Release);
                info!("🔗 Fabric backend {} reachable again, leaving fallback mode", remote.name());
                self.resubscribe(remote).await;
                Some(Arc::clone(remote))
            }
            Ok(Err(e)) => {
                debug!("Fabric reconnect probe failed: {}", e);
                None
            }
            Err(_) => {
                debug!("Fabric reconnect probe timed out");
                None
            }
        }
    }

    async fn resubscribe(&self, remote: &Arc<dyn FabricBackend>) {
        let pending: Vec<(String, broadcast::Sender<String>)> = self
            .inner
            .channels
            .iter()
            .filter(|entry| !self.inner.remote_channels.contains_key(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let timeout = self.inner.config.command_timeout;
        for (channel, sender) in pending {
            match tokio::time::timeout(timeout, remote.subscribe(&channel, sender)).await {
                Ok(Ok(())) => {
                    self.inner.remote_channels.insert(channel, ());
                }
                _ => debug!("Fabric resubscribe to {} failed, will retry", channel),
            }
        }
    }

    fn enter_degraded(&self, reason: &str) {
        self.inner.remote_errors.fetch_add(1, Ordering::Relaxed);
        if !self.inner.degraded.swap(true, Ordering::AcqRel) {
            self.inner
                .last_probe_ms
                .store(current_timestamp_ms(), Ordering::Release);
            warn!("⚠️ Fabric remote failed ({}), switching to local fallback mode", reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wraps a memory backend and fails every call while switched off.
    struct FlakyBackend {
        inner: MemoryBackend,
        down: AtomicBool,
        slow: AtomicBool,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::default(),
                down: AtomicBool::new(false),
                slow: AtomicBool::new(false),
            }
        }

        async fn gate(&self) -> Result<(), FabricError> {
            if self.slow.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.down.load(Ordering::Acquire) {
                return Err(FabricError::Unavailable("switched off".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FabricBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), FabricError> {
            self.gate().await?;
            self.inner.set_with_ttl(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>, FabricError> {
            self.gate().await?;
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<(), FabricError> {
            self.gate().await?;
            self.inner.delete(key).await
        }
        async fn publish(&self, channel: &str, message: &str) -> Result<(), FabricError> {
            self.gate().await?;
            self.inner.publish(channel, message).await
        }
        async fn subscribe(&self, channel: &str, sink: broadcast::Sender<String>) -> Result<(), FabricError> {
            self.gate().await?;
            self.inner.subscribe(channel, sink).await
        }
        async fn ping(&self) -> Result<(), FabricError> {
            self.gate().await
        }
    }

    fn fast_config() -> FabricConfig {
        FabricConfig {
            command_timeout: Duration::from_millis(50),
            retry_interval: Duration::from_millis(100),
            channel_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_local_fabric_round_trip() {
        let fabric = Fabric::local(FabricConfig::default());
        fabric.set_with_ttl("k", "v", Duration::from_secs(10)).await;
        assert_eq!(fabric.get("k").await.as_deref(), Some("v"));
        assert_eq!(fabric.get("missing").await, None);
        fabric.delete("k").await;
        assert_eq!(fabric.get("k").await, None);

        let stats = fabric.stats();
        assert_eq!(stats.mode, FabricMode::Local);
        assert_eq!((stats.hits, stats.misses), (1, 2));
        assert_eq!(stats.fallback_operations, 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let fabric = Fabric::local(FabricConfig::default());
        fabric.set_with_ttl("short", "v", Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fabric.get("short").await, None);
    }

    #[tokio::test]
    async fn test_shared_backend_is_visible_across_fabrics() {
        let shared: Arc<dyn FabricBackend> = Arc::new(MemoryBackend::default());
        let a = Fabric::with_backend(Arc::clone(&shared), FabricConfig::default());
        let b = Fabric::with_backend(shared, FabricConfig::default());

        let mut events = b.subscribe("cluster:events").await;
        a.set_with_ttl("cluster:instance:a", "{}", Duration::from_secs(15)).await;
        assert_eq!(b.get("cluster:instance:a").await.as_deref(), Some("{}"));

        a.publish("cluster:events", "hello").await;
        let message = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("message should arrive")
            .expect("channel open");
        assert_eq!(message, "hello");
    }

    #[tokio::test]
    async fn test_fallback_and_recovery() {
        let flaky = Arc::new(FlakyBackend::new());
        let fabric = Fabric::with_backend(flaky.clone(), fast_config());

        fabric.set_with_ttl("before", "1", Duration::from_secs(60)).await;
        assert_eq!(fabric.mode(), FabricMode::Remote);

        flaky.down.store(true, Ordering::Release);
        // reads and writes keep working, served locally
        assert_eq!(fabric.get("before").await.as_deref(), Some("1"));
        assert!(fabric.is_degraded());
        fabric.set_with_ttl("during", "2", Duration::from_secs(60)).await;
        assert_eq!(fabric.get("during").await.as_deref(), Some("2"));
        let stats = fabric.stats();
        assert!(stats.remote_errors >= 1);
        assert!(stats.fallback_operations >= 2);

        flaky.down.store(false, Ordering::Release);
        tokio::time::sleep(Duration::from_millis(150)).await;
        fabric.set_with_ttl("after", "3", Duration::from_secs(60)).await;
        assert_eq!(fabric.mode(), FabricMode::Remote);
        assert_eq!(flaky.inner.get("after").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let flaky = Arc::new(FlakyBackend::new());
        let fabric = Fabric::with_backend(flaky.clone(), fast_config());
        flaky.slow.store(true, Ordering::Release);

        let started = std::time::Instant::now();
        fabric.set_with_ttl("k", "v", Duration::from_secs(60)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(fabric.is_degraded());
        assert_eq!(fabric.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_publish_reaches_local_subscribers_while_degraded() {
        let flaky = Arc::new(FlakyBackend::new());
        flaky.down.store(true, Ordering::Release);
        let fabric = Fabric::with_backend(flaky, fast_config());

        let mut receiver = fabric.subscribe("cluster:events").await;
        fabric.publish("cluster:events", "local-only").await;
        let message = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("message should arrive")
            .expect("channel open");
        assert_eq!(message, "local-only");
    }

    #[tokio::test]
    async fn test_purge_drops_expired_local_keys() {
        let fabric = Fabric::local(FabricConfig::default());
        fabric.set_with_ttl("short", "1", Duration::from_millis(20)).await;
        fabric.set_with_ttl("forever", "2", Duration::ZERO).await;
        assert_eq!(fabric.local_len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fabric.purge_expired(), 1);
        assert_eq!(fabric.local_len(), 1);
        assert_eq!(fabric.get("forever").await.as_deref(), Some("2"));
    }
}
