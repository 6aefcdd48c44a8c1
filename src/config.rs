//! Pipeline configuration.
//!
//! Values come from code (builder methods), from the environment (`TASKPIPE_*` variables, see
//! [`PipelineConfig::from_env`]) or from a JSON document. Durations are expressed in
//! milliseconds in serialized form.

pub use crate::cache::CacheConfig;
pub use crate::resilience::RateLimiterConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of queued (not yet dequeued) jobs.
    pub queue_capacity: usize,
    /// Number of worker tasks pulling from the queue.
    pub workers: usize,
    /// Optional cap on concurrently running handlers, independent of `workers`.
    pub max_concurrency: Option<usize>,
    pub rate_limit: RateLimiterConfig,
    pub cache: CacheConfig,
    /// Deadline applied to tasks submitted without one.
    #[serde(rename = "default_timeout_ms", with = "duration_ms_opt")]
    pub default_timeout: Option<Duration>,
    /// Drain window used by `TaskController::shutdown_default`.
    #[serde(rename = "drain_timeout_ms", with = "duration_ms")]
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            workers: 2,
            max_concurrency: None,
            rate_limit: RateLimiterConfig::default(),
            cache: CacheConfig::default(),
            default_timeout: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse::<T>().ok()
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `TASKPIPE_*` environment variables.
    ///
    /// - `TASKPIPE_QUEUE_CAPACITY`, `TASKPIPE_WORKERS`, `TASKPIPE_MAX_CONCURRENCY`
    /// - `TASKPIPE_RATE_CAPACITY`, `TASKPIPE_RATE_REFILL_PER_SEC`, `TASKPIPE_RATE_MAX_KEYS`
    /// - `TASKPIPE_CACHE_TTL_SECS`, `TASKPIPE_CACHE_MAX_ENTRIES`, `TASKPIPE_CACHE_SWEEP_SECS`
    /// - `TASKPIPE_DEFAULT_TIMEOUT_MS`, `TASKPIPE_DRAIN_TIMEOUT_MS`
    ///
    /// Unparseable values are ignored and the default is kept. Call [`PipelineConfig::validate`]
    /// (or build a controller, which validates) to reject out-of-range values.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("TASKPIPE_QUEUE_CAPACITY") {
            cfg.queue_capacity = v;
        }
        if let Some(v) = env_parse("TASKPIPE_WORKERS") {
            cfg.workers = v;
        }
        if let Some(v) = env_parse("TASKPIPE_MAX_CONCURRENCY") {
            cfg.max_concurrency = Some(v);
        }
        if let Some(v) = env_parse("TASKPIPE_RATE_CAPACITY") {
            cfg.rate_limit.capacity = v;
        }
        if let Some(v) = env_parse("TASKPIPE_RATE_REFILL_PER_SEC") {
            cfg.rate_limit.refill_per_second = v;
        }
        if let Some(v) = env_parse("TASKPIPE_RATE_MAX_KEYS") {
            cfg.rate_limit.max_keys = Some(v);
        }
        if let Some(secs) = env_parse::<u64>("TASKPIPE_CACHE_TTL_SECS") {
            cfg.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse("TASKPIPE_CACHE_MAX_ENTRIES") {
            cfg.cache.max_entries = Some(v);
        }
        if let Some(secs) = env_parse::<u64>("TASKPIPE_CACHE_SWEEP_SECS") {
            cfg.cache.sweep_interval = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = env_parse::<u64>("TASKPIPE_DEFAULT_TIMEOUT_MS").filter(|ms| *ms > 0) {
            cfg.default_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("TASKPIPE_DRAIN_TIMEOUT_MS") {
            cfg.drain_timeout = Duration::from_millis(ms);
        }
        cfg
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimiterConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::invalid_field(
                "queue_capacity",
                "must be greater than zero",
            ));
        }
        if self.workers == 0 {
            return Err(Error::invalid_field("workers", "must be greater than zero"));
        }
        if self.max_concurrency == Some(0) {
            return Err(Error::invalid_field(
                "max_concurrency",
                "must be greater than zero when set",
            ));
        }
        if self.default_timeout.is_some_and(|d| d.is_zero()) {
            return Err(Error::invalid_field(
                "default_timeout_ms",
                "must be greater than zero when set",
            ));
        }
        self.rate_limit.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// `Option<Duration>` as optional integer milliseconds.
pub(crate) mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
