use crate::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    pub capacity: f64,
    pub refill_per_second: f64,
    pub tokens: f64,
    /// Estimated wait time until a token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Maximum burst size (tokens). A fresh key starts with this many.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_second: f64,
    /// Upper bound on tracked keys; the least recently seen bucket is evicted past it.
    /// Concurrent first calls for new keys may overshoot it briefly; it holds again once they
    /// return. `None` tracks every key for the life of the limiter.
    pub max_keys: Option<usize>,
}

impl RateLimiterConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self {
            capacity: 10.0,
            refill_per_second: 2.0,
            max_keys: None,
        }
    }

    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return None;
        }
        Some(Self {
            capacity: rps.max(1.0), // default burst: 1 second worth, at least 1
            refill_per_second: rps,
            max_keys: None,
        })
    }

    /// Set the maximum tokens (burst size)
    pub fn with_capacity(mut self, tokens: u32) -> Self {
        self.capacity = tokens as f64;
        self
    }

    /// Set the refill rate (tokens per second)
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_per_second = rate;
        self
    }

    pub fn with_max_keys(mut self, max: usize) -> Self {
        self.max_keys = Some(max);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.capacity.is_finite() || self.capacity < 1.0 {
            return Err(Error::invalid_field(
                "rate_limit.capacity",
                format!("must be a finite number >= 1, got {}", self.capacity),
            ));
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second <= 0.0 {
            return Err(Error::invalid_field(
                "rate_limit.refill_per_second",
                format!(
                    "must be a finite number > 0, got {}",
                    self.refill_per_second
                ),
            ));
        }
        if self.max_keys == Some(0) {
            return Err(Error::invalid_field(
                "rate_limit.max_keys",
                "must be greater than zero when set",
            ));
        }
        Ok(())
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn full(cfg: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            capacity: cfg.capacity,
            tokens: cfg.capacity,
            // a negative or NaN rate would drain the bucket on refill
            refill_per_second: cfg.refill_per_second.max(0.0),
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available. Saturates at `Duration::MAX` when the refill
    /// rate is too small (or zero) for the wait to be representable.
    fn wait_for_token(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        if missing == 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(missing / self.refill_per_second).unwrap_or(Duration::MAX)
    }
}

type SharedBucket = Arc<Mutex<Bucket>>;

// Bucket arithmetic is a handful of float assignments; a poisoned lock still holds a usable state.
fn lock(bucket: &SharedBucket) -> MutexGuard<'_, Bucket> {
    bucket.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-key token-bucket rate limiter.
///
/// - One bucket per key, created full on first use
/// - Refill-and-take is atomic per bucket; different keys never share a lock
/// - Optional cap on tracked keys with least-recently-seen eviction
pub struct KeyedRateLimiter {
    cfg: RateLimiterConfig,
    buckets: DashMap<String, SharedBucket>,
}

impl KeyedRateLimiter {
    /// `cfg` is taken as is; run [`RateLimiterConfig::validate`] first to reject a refill rate
    /// that would leave a drained bucket empty forever.
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            cfg,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn bucket(&self, key: &str) -> SharedBucket {
        if let Some(b) = self.buckets.get(key) {
            return b.value().clone();
        }
        if let Some(max) = self.cfg.max_keys {
            while self.buckets.len() >= max {
                if !self.evict_least_recent() {
                    break;
                }
            }
        }
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::full(&self.cfg, Instant::now()))))
            .value()
            .clone();
        // Another caller may have inserted a new key between the check above and the insert.
        if let Some(max) = self.cfg.max_keys {
            while self.buckets.len() > max {
                if !self.evict_least_recent() {
                    break;
                }
            }
        }
        bucket
    }

    fn evict_least_recent(&self) -> bool {
        // Clone the handles first so no map shard is held while bucket locks are taken.
        let candidates: Vec<(String, SharedBucket)> = self
            .buckets
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let oldest = candidates
            .into_iter()
            .map(|(k, b)| (lock(&b).last_seen, k))
            .min_by_key(|(seen, _)| *seen)
            .map(|(_, k)| k);
        match oldest {
            Some(k) => {
                debug!(key = %k, "evicting least recently seen rate-limit bucket");
                self.buckets.remove(&k).is_some()
            }
            None => false,
        }
    }

    /// Take one token for `key` if available.
    pub fn allow(&self, key: &str) -> bool {
        let bucket = self.bucket(key);
        let allowed = lock(&bucket).try_take(Instant::now());
        if !allowed {
            debug!(key, "rate limit bucket exhausted");
        }
        allowed
    }

    /// Acquire one token for `key` (may sleep until one refills).
    pub async fn acquire(&self, key: &str) {
        let bucket = self.bucket(key);
        loop {
            let wait_duration = {
                let mut b = lock(&bucket);
                if b.try_take(Instant::now()) {
                    return;
                }
                b.wait_for_token()
            };
            tokio::time::sleep(wait_duration).await;
        }
    }

    /// Current state of `key`'s bucket, `None` if the key has never been seen.
    pub fn snapshot(&self, key: &str) -> Option<BucketSnapshot> {
        let bucket = self.buckets.get(key)?.value().clone();
        let mut b = lock(&bucket);
        b.refill(Instant::now());
        let estimated_wait_ms = if b.tokens < 1.0 {
            Some(u64::try_from(b.wait_for_token().as_millis()).unwrap_or(u64::MAX))
        } else {
            None
        };
        Some(BucketSnapshot {
            capacity: b.capacity,
            refill_per_second: b.refill_per_second,
            tokens: b.tokens,
            estimated_wait_ms,
        })
    }

    /// Number of keys with a live bucket.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Drop `key`'s bucket; its next call starts from a full bucket again.
    pub fn forget(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }
}

impl std::fmt::Debug for KeyedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedRateLimiter")
            .field("cfg", &self.cfg)
            .field("tracked_keys", &self.buckets.len())
            .finish()
    }
}
