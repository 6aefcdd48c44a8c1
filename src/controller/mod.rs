//! 任务控制器模块：提交、限流、缓存、超时/取消与优雅关闭的统一入口。
//!
//! # Task Controller Module
//!
//! Ties the rate limiter, the result cache, the bounded queue and the worker pool together
//! behind one `submit` call, and coordinates graceful shutdown across them.
//!
//! ## Overview
//!
//! A submission flows through:
//!
//! ```text
//! submit ─> cache hit? ──yes──> return (free)
//!              │no
//!              v
//!          rate limiter ──denied──> Error::RateLimited
//!              │allowed
//!              v
//!          bounded queue (backpressure) ─> worker ─> handler
//!              │
//!              v
//!          result | ctx cancelled | deadline  (first wins)
//!              │ok
//!              v
//!          cache.set ─> return
//! ```
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TaskController`] | Submission, cancellation, shutdown |
//! | [`TaskControllerBuilder`] | Configuration and collaborator injection |
//! | [`PipelineStats`] | Terminal-state counters and mean latency |
//! | [`PipelineSignals`] | Snapshot of queue, pool, limiter and cache state |
//!
//! ## Example
//!
//! ```rust
//! use taskpipe::controller::TaskControllerBuilder;
//! use taskpipe::task::Task;
//! use taskpipe::worker::handler_fn;
//! use taskpipe::BoxError;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let controller = TaskControllerBuilder::new()
//!     .workers(2)
//!     .build(handler_fn(|x: f64, _ctx| async move { Ok::<_, BoxError>(x * 0.5) }))
//!     .unwrap();
//!
//! let task = Task::new(3.0).with_cache_key("3.0|v1");
//! let out = controller
//!     .submit(task, "203.0.113.7", CancellationToken::new())
//!     .await
//!     .unwrap();
//! assert_eq!(out, 1.5);
//!
//! controller.shutdown_default().await.unwrap();
//! # });
//! ```

mod builder;
mod core;
mod signals;
mod stats;

pub use builder::TaskControllerBuilder;
pub use core::TaskController;
pub use signals::PipelineSignals;
pub use stats::PipelineStats;
