//! 结果缓存模块：提供带过期时间（TTL）的并发键值缓存。
//!
//! # Result Caching Module
//!
//! An in-memory, time-to-live cache shared by the task controller and by collaborators that
//! want response-level caching independent of task execution.
//!
//! ## Overview
//!
//! - An entry is never returned once it is older than the configured TTL
//! - `set` always overwrites and resets the entry's age
//! - Reads and writes on different keys do not block each other (sharded map)
//! - Expiry is enforced on read; an optional background sweeper and an optional entry cap bound
//!   memory for workloads with many one-off keys
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TtlCache`] | The expiring store |
//! | [`CacheConfig`] | TTL, entry cap, sweep interval |
//! | [`CacheStats`] | Hit/miss/expiry/eviction counters |
//!
//! ## Example
//!
//! ```rust
//! use taskpipe::cache::{CacheConfig, TtlCache};
//! use std::time::Duration;
//!
//! let cache: TtlCache<String, f64> =
//!     TtlCache::new(CacheConfig::new().with_ttl(Duration::from_secs(30)));
//!
//! cache.set("1.000000|2.000000|v1".to_string(), 0.73);
//! assert_eq!(cache.get(&"1.000000|2.000000|v1".to_string()), Some(0.73));
//! ```

mod stats;
mod ttl;

pub use stats::CacheStats;
pub use ttl::{CacheConfig, TtlCache};
