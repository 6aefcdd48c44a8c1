//! Expiring in-memory store.

use super::stats::{AtomicStats, CacheStats};
use crate::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "ttl_ms", with = "crate::config::duration_ms")]
    pub ttl: Duration,
    /// Cap on stored entries; the least recently accessed entry is evicted past it. Concurrent
    /// inserts of new keys may overshoot it briefly; it holds again once they return.
    pub max_entries: Option<usize>,
    /// Period of the optional background sweep that removes stale entries.
    #[serde(rename = "sweep_interval_ms", with = "crate::config::duration_ms_opt")]
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_entries: None,
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn with_sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_interval = Some(every);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::invalid_field("cache.ttl_ms", "must be greater than zero"));
        }
        if self.max_entries == Some(0) {
            return Err(Error::invalid_field(
                "cache.max_entries",
                "must be greater than zero when set",
            ));
        }
        if self.sweep_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::invalid_field(
                "cache.sweep_interval_ms",
                "must be greater than zero when set",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    last_accessed: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: Instant) -> Self {
        Self {
            value,
            stored_at: now,
            last_accessed: now,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) > ttl
    }
}

/// Key/value store whose entries stop being served once older than the TTL.
///
/// Backed by a sharded concurrent map: operations on different keys do not contend, operations
/// on the same key are serialized by the shard lock. Expiry is enforced on read; stale entries
/// are removed lazily, by [`TtlCache::purge_expired`], or by the optional sweeper.
pub struct TtlCache<K, V> {
    config: CacheConfig,
    entries: DashMap<K, CacheEntry<V>>,
    stats: AtomicStats,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            stats: AtomicStats::new(),
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(CacheConfig::new().with_ttl(ttl))
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fresh value for `key`, or `None` if absent or older than the TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        match self.entries.get_mut(key) {
            None => {
                self.stats.record_miss();
                return None;
            }
            Some(mut entry) => {
                if !entry.is_expired(now, ttl) {
                    entry.last_accessed = now;
                    self.stats.record_hit();
                    return Some(entry.value.clone());
                }
            }
        }
        // A concurrent set may have refreshed the entry since the guard was released.
        if self
            .entries
            .remove_if(key, |_, e| e.is_expired(now, ttl))
            .is_some()
        {
            self.stats.record_expired(1);
        }
        self.stats.record_miss();
        None
    }

    /// Insert or overwrite `key`, resetting its age.
    pub fn set(&self, key: K, value: V) {
        let now = Instant::now();
        if let Some(max) = self.config.max_entries {
            if !self.entries.contains_key(&key) {
                self.make_room(max, now);
            }
        }
        self.entries.insert(key, CacheEntry::new(value, now));
        self.stats.record_set();
        // Other writers may have filled the room made above before this insert landed.
        if let Some(max) = self.config.max_entries {
            self.evict_down_to(max);
        }
    }

    fn make_room(&self, max: usize, now: Instant) {
        if self.entries.len() < max {
            return;
        }
        self.purge_expired_at(now);
        self.evict_down_to(max.saturating_sub(1));
    }

    fn evict_down_to(&self, limit: usize) {
        while self.entries.len() > limit {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_accessed)
                .map(|e| e.key().clone());
            match oldest {
                Some(k) => {
                    if self.entries.remove(&k).is_some() {
                        self.stats.record_eviction();
                    }
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .remove(key)
            .and_then(|(_, e)| (!e.is_expired(now, self.config.ttl)).then_some(e.value))
    }

    /// Whether a fresh entry exists. Does not touch statistics or access time.
    pub fn contains_key(&self, key: &K) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|e| !e.is_expired(now, self.config.ttl))
            .unwrap_or(false)
    }

    /// Raw number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every stale entry; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let ttl = self.config.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now, ttl));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.stats.record_expired(removed as u64);
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Periodically purge stale entries until `token` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(removed, "cache sweep removed stale entries");
                        }
                    }
                }
            }
            debug!("cache sweeper stopped");
        })
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("ttl", &self.config.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}
