use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;

/// Sliding window in-memory rate limiter (process local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled { return true; }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window { entry.pop_front(); } else { break; }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drops every key whose most recent hit is older than `idle`.
    pub fn purge_idle(&self, idle: Duration) {
        let now = Instant::now();
        self.store.retain(|_, hits| hits.back().is_some_and(|t| now.duration_since(*t) < idle));
    }

    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}

/// Per-action limits. Deletion attempts are limited separately so a wrong
/// secret cannot be brute forced from one address.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub create_limit: usize,
    pub create_window: Duration,
    pub delete_limit: usize,
    pub delete_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            create_limit: 5,
            create_window: Duration::from_secs(3600),
            delete_limit: 10,
            delete_window: Duration::from_secs(600),
        }
    }
}

/// High level guard used by handlers.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
    checks: Arc<AtomicUsize>,
}

// Idle keys are purged once every this many checks.
const PURGE_EVERY: usize = 256;

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self { Self { limiter, cfg, checks: Arc::new(AtomicUsize::new(0)) } }
    pub fn allow_create(&self, ip: &str) -> bool { self.guarded(&format!("create:{ip}"), self.cfg.create_limit, self.cfg.create_window) }
    pub fn allow_delete(&self, ip: &str) -> bool { self.guarded(&format!("delete:{ip}"), self.cfg.delete_limit, self.cfg.delete_window) }

    fn guarded(&self, key: &str, limit: usize, window: Duration) -> bool {
        let allowed = self.limiter.check(key, limit, window);
        if self.checks.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.limiter.purge_idle(self.cfg.create_window.max(self.cfg.delete_window));
        }
        allowed
    }
}
