//! 弹性模式模块：提供按键限流的令牌桶准入控制。
//!
//! # Resilience Primitives Module
//!
//! Admission control for the dispatch pipeline.
//!
//! ## Overview
//!
//! Rate limiting protects the worker pool from a single noisy caller:
//! - Each caller identity (client IP, API key, tenant) gets its own token bucket
//! - A fresh identity starts with a full bucket, so short bursts are admitted immediately
//! - Rejected calls are cheap: nothing is queued and no work is scheduled
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter::KeyedRateLimiter`] | Per-key token bucket with optional key cap |
//! | [`rate_limiter::RateLimiterConfig`] | Capacity, refill rate, eviction cap |
//! | [`rate_limiter::BucketSnapshot`] | Point-in-time view of one bucket |
//!
//! ## Rate Limiter
//!
//! ```rust
//! use taskpipe::resilience::rate_limiter::{KeyedRateLimiter, RateLimiterConfig};
//!
//! let config = RateLimiterConfig::new()
//!     .with_capacity(10)
//!     .with_refill_rate(2.0); // 2 tokens per second
//! let limiter = KeyedRateLimiter::new(config);
//!
//! if limiter.allow("203.0.113.7") {
//!     // Proceed with request...
//! }
//! ```

pub mod rate_limiter;

pub use rate_limiter::{BucketSnapshot, KeyedRateLimiter, RateLimiterConfig};
