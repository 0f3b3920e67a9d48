//! Rate limiting using sliding windows with escalation.
//!
//! Every inbound event kind has up to three limits, checked in order:
//! per-IP, per-player and global. The first scope that is full rejects the
//! request with a retry-after hint. Only accepted requests are recorded, so a
//! client hammering a full window does not push its own recovery further out.
//!
//! Rejections accumulate warnings on the offending player (or on the IP when
//! the connection is not yet authenticated). Once the warning threshold is
//! reached the originating IP is blocked for `block_base_ms × warnings`, and
//! blocked IPs are refused before any window is consulted.

use crate::types::PlayerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Inbound event kinds subject to rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateEvent {
    Authenticate,
    EnterChunk,
    Move,
    Attack,
    Mine,
    Respawn,
    Stats,
}

impl RateEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RateEvent::Authenticate => "authenticate",
            RateEvent::EnterChunk => "enter_chunk",
            RateEvent::Move => "move",
            RateEvent::Attack => "attack",
            RateEvent::Mine => "mine",
            RateEvent::Respawn => "respawn",
            RateEvent::Stats => "stats",
        }
    }
}

/// `max_count` accepted events per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub max_count: u32,
    pub window_ms: u64,
}

impl LimitRule {
    pub const fn new(max_count: u32, window_ms: u64) -> Self {
        Self { max_count, window_ms }
    }
}

/// The three scopes of one event kind. `None` disables a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventLimits {
    #[serde(default)]
    pub per_ip: Option<LimitRule>,
    #[serde(default)]
    pub per_player: Option<LimitRule>,
    #[serde(default)]
    pub global: Option<LimitRule>,
}

/// Rate limiter tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub limits: BTreeMap<RateEvent, EventLimits>,
    /// Warnings that trigger an IP block
    pub warning_threshold: u32,
    /// Block length per accumulated warning
    pub block_base_ms: u64,
    /// Quiet period after which warnings are forgotten
    pub warning_decay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let global = Some(LimitRule::new(5000, 1000));
        let per_player = |max_count, window_ms| EventLimits {
            per_ip: None,
            per_player: Some(LimitRule::new(max_count, window_ms)),
            global,
        };

        let mut limits = BTreeMap::new();
        limits.insert(
            RateEvent::Authenticate,
            EventLimits {
                per_ip: Some(LimitRule::new(5, 60_000)),
                per_player: None,
                global,
            },
        );
        limits.insert(RateEvent::Move, per_player(30, 1000));
        limits.insert(RateEvent::Attack, per_player(5, 1000));
        limits.insert(RateEvent::EnterChunk, per_player(10, 1000));
        limits.insert(RateEvent::Mine, per_player(10, 1000));
        limits.insert(RateEvent::Respawn, per_player(2, 1000));
        limits.insert(RateEvent::Stats, per_player(2, 1000));

        Self {
            limits,
            warning_threshold: 5,
            block_base_ms: 10_000,
            warning_decay_ms: 60_000,
        }
    }
}

/// Which limit produced a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    BlockedIp,
    Ip,
    Player,
    Global,
}

/// A rate-limited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRejection {
    pub event: RateEvent,
    pub scope: LimitScope,
    /// Always at least 1
    pub retry_after_ms: u64,
}

impl fmt::Display for RateLimitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} limited ({:?}), retry after {} ms",
            self.event.name(),
            self.scope,
            self.retry_after_ms
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Subject {
    Ip(IpAddr),
    Player(PlayerId),
    Global,
}

#[derive(Debug, Clone)]
struct Window {
    window_ms: u64,
    accepted: VecDeque<u64>,
}

impl Window {
    fn prune(&mut self, now: u64) {
        let window_ms = self.window_ms;
        while self.accepted.front().is_some_and(|ts| ts.saturating_add(window_ms) <= now) {
            self.accepted.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Warnings {
    count: u32,
    last_at: u64,
}

/// Counters exposed in stats snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub rejected_total: u64,
    pub blocks_total: u64,
    pub active_blocks: usize,
    pub tracked_windows: usize,
}

/// Sliding-window rate limiter owned by the world loop.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: HashMap<(Subject, RateEvent), Window>,
    warnings: HashMap<Subject, Warnings>,
    blocked: HashMap<IpAddr, u64>,
    rejected_total: u64,
    blocks_total: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            warnings: HashMap::new(),
            blocked: HashMap::new(),
            rejected_total: 0,
            blocks_total: 0,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Checks one request and records it if accepted.
    pub fn check(
        &mut self,
        event: RateEvent,
        ip: IpAddr,
        player: Option<PlayerId>,
        now: u64,
    ) -> Result<(), RateLimitRejection> {
        if let Some(until) = self.blocked.get(&ip).copied() {
            if now < until {
                self.rejected_total += 1;
                return Err(RateLimitRejection {
                    event,
                    scope: LimitScope::BlockedIp,
                    retry_after_ms: until - now,
                });
            }
            self.blocked.remove(&ip);
        }

        let limits = self.config.limits.get(&event).copied().unwrap_or_default();
        let mut scopes: Vec<(Subject, LimitRule, LimitScope)> = Vec::with_capacity(3);
        if let Some(rule) = limits.per_ip {
            scopes.push((Subject::Ip(ip), rule, LimitScope::Ip));
        }
        if let (Some(rule), Some(player)) = (limits.per_player, player) {
            scopes.push((Subject::Player(player), rule, LimitScope::Player));
        }
        if let Some(rule) = limits.global {
            scopes.push((Subject::Global, rule, LimitScope::Global));
        }

        for (subject, rule, scope) in &scopes {
            let window = self
                .windows
                .entry((*subject, event))
                .or_insert_with(|| Window {
                    window_ms: rule.window_ms,
                    accepted: VecDeque::new(),
                });
            window.window_ms = rule.window_ms;
            window.prune(now);

            if window.accepted.len() as u64 >= rule.max_count as u64 {
                let oldest = window.accepted.front().copied().unwrap_or(now);
                let retry_after_ms = (oldest + rule.window_ms).saturating_sub(now).max(1);
                let rejection = RateLimitRejection {
                    event,
                    scope: *scope,
                    retry_after_ms,
                };
                self.register_violation(ip, player, now);
                return Err(rejection);
            }
        }

        for (subject, _, _) in &scopes {
            if let Some(window) = self.windows.get_mut(&(*subject, event)) {
                window.accepted.push_back(now);
            }
        }
        Ok(())
    }

    /// Whether `ip` is currently blocked.
    pub fn is_blocked(&self, ip: IpAddr, now: u64) -> bool {
        self.blocked.get(&ip).is_some_and(|until| now < *until)
    }

    /// Current warning count for a player, after decay.
    pub fn warnings_for_player(&self, player: PlayerId, now: u64) -> u32 {
        self.warnings
            .get(&Subject::Player(player))
            .filter(|w| now.saturating_sub(w.last_at) <= self.config.warning_decay_ms)
            .map(|w| w.count)
            .unwrap_or(0)
    }

    /// Prunes windows, expired blocks and stale warnings.
    pub fn sweep(&mut self, now: u64) -> usize {
        let before = self.windows.len() + self.blocked.len() + self.warnings.len();

        self.windows.retain(|_, window| {
            window.prune(now);
            !window.accepted.is_empty()
        });
        self.blocked.retain(|_, until| now < *until);
        let decay = self.config.warning_decay_ms;
        self.warnings
            .retain(|_, w| now.saturating_sub(w.last_at) <= decay);

        let removed = before - (self.windows.len() + self.blocked.len() + self.warnings.len());
        if removed > 0 {
            debug!("🧹 Rate limiter sweep removed {} entries", removed);
        }
        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            rejected_total: self.rejected_total,
            blocks_total: self.blocks_total,
            active_blocks: self.blocked.len(),
            tracked_windows: self.windows.len(),
        }
    }

    fn register_violation(&mut self, ip: IpAddr, player: Option<PlayerId>, now: u64) {
        self.rejected_total += 1;
        let subject = player.map(Subject::Player).unwrap_or(Subject::Ip(ip));
        let decay = self.config.warning_decay_ms;

        let warnings = self.warnings.entry(subject).or_insert(Warnings { count: 0, last_at: now });
        if now.saturating_sub(warnings.last_at) > decay {
            warnings.count = 0;
        }
        warnings.count += 1;
        warnings.last_at = now;
        let count = warnings.count;

        if count >= self.config.warning_threshold {
            let duration = self.config.block_base_ms.saturating_mul(count as u64);
            self.blocked.insert(ip, now.saturating_add(duration));
            self.blocks_total += 1;
            warn!(
                ip = %ip,
                warnings = count,
                "🚫 Blocking IP for {} ms after repeated rate limit violations",
                duration
            );
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

    #[test]
    fn test_move_limit_rejects_31st_and_recovers() {
        let mut limiter = RateLimiter::default();
        let player = PlayerId::from_account_name("vega");

        for t in 0..30u64 {
            assert!(limiter.check(RateEvent::Move, IP, Some(player), t).is_ok());
        }
        let rejection = limiter
            .check(RateEvent::Move, IP, Some(player), 30)
            .unwrap_err();
        assert_eq!(rejection.scope, LimitScope::Player);
        assert!(rejection.retry_after_ms > 0);
        assert_eq!(rejection.retry_after_ms, 970);

        assert!(limiter.check(RateEvent::Move, IP, Some(player), 1000).is_ok());
    }

    #[test]
    fn test_rejected_requests_are_not_recorded() {
        let mut limiter = RateLimiter::default();
        let player = PlayerId::from_account_name("vega");
        for t in 0..5u64 {
            limiter.check(RateEvent::Attack, IP, Some(player), t).unwrap();
        }
        for _ in 0..3 {
            assert!(limiter.check(RateEvent::Attack, IP, Some(player), 500).is_err());
        }
        // the window opens exactly as far as the accepted stamps allow
        assert!(limiter.check(RateEvent::Attack, IP, Some(player), 1000).is_ok());
    }

    #[test]
    fn test_authenticate_is_limited_per_ip() {
        let mut limiter = RateLimiter::default();
        for t in 0..5u64 {
            limiter.check(RateEvent::Authenticate, IP, None, t).unwrap();
        }
        let rejection = limiter
            .check(RateEvent::Authenticate, IP, None, 10)
            .unwrap_err();
        assert_eq!(rejection.scope, LimitScope::Ip);

        let other: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.check(RateEvent::Authenticate, other, None, 10).is_ok());
    }

    #[test]
    fn test_repeated_violations_block_the_ip() {
        let mut limiter = RateLimiter::default();
        let player = PlayerId::from_account_name("spammer");
        for t in 0..5u64 {
            limiter.check(RateEvent::Attack, IP, Some(player), t).unwrap();
        }
        for _ in 0..5 {
            let _ = limiter.check(RateEvent::Attack, IP, Some(player), 10);
        }
        assert!(limiter.is_blocked(IP, 11));
        assert_eq!(limiter.stats().blocks_total, 1);

        // blocked before any window is consulted, even for other kinds
        let rejection = limiter
            .check(RateEvent::Move, IP, Some(player), 20)
            .unwrap_err();
        assert_eq!(rejection.scope, LimitScope::BlockedIp);
        assert_eq!(rejection.retry_after_ms, 10 + 50_000 - 20);

        assert!(!limiter.is_blocked(IP, 10 + 50_000));
        assert!(limiter.check(RateEvent::Move, IP, Some(player), 50_010).is_ok());
    }

    #[test]
    fn test_warnings_decay_after_quiet_period() {
        let mut limiter = RateLimiter::default();
        let player = PlayerId::from_account_name("vega");
        for t in 0..5u64 {
            limiter.check(RateEvent::Attack, IP, Some(player), t).unwrap();
        }
        let _ = limiter.check(RateEvent::Attack, IP, Some(player), 10);
        assert_eq!(limiter.warnings_for_player(player, 10), 1);
        assert_eq!(limiter.warnings_for_player(player, 70_011), 0);
    }

    #[test]
    fn test_sweep_prunes_idle_state() {
        let mut limiter = RateLimiter::default();
        let player = PlayerId::from_account_name("vega");
        limiter.check(RateEvent::Move, IP, Some(player), 0).unwrap();
        assert!(limiter.stats().tracked_windows > 0);

        limiter.sweep(5_000);
        assert_eq!(limiter.stats().tracked_windows, 0);
    }
}
