//! # taskpipe
//!
//! 进程内有界任务调度管线：背压队列、限流、结果缓存、超时与取消。
//!
//! An in-process task-dispatch pipeline for a single service instance: a backpressured
//! bounded queue, a concurrency-limited worker pool, per-task deadlines and cooperative
//! cancellation, a per-key token-bucket rate limiter and a TTL result cache.
//!
//! ## Overview
//!
//! Callers submit [`Task`]s to a [`TaskController`]. The controller returns fresh cached
//! results for free, rejects callers whose rate-limit bucket is empty, and otherwise pushes a
//! job onto a [`queue::BoundedQueue`]; a full queue makes the submitter wait instead of buffering
//! without bound. Workers dequeue in FIFO order and run a [`TaskHandler`].
//!
//! ## Core Guarantees
//!
//! - **Bounded memory**: queue occupancy never exceeds its capacity
//! - **Exactly once**: every submitted task reaches exactly one terminal [`TaskState`]
//! - **Contained failure**: a handler error or panic fails only its own task
//! - **Cooperative cancellation**: queued jobs are skipped, running handlers are signalled
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskpipe::{handler_fn, BoxError, PipelineConfig, Task, TaskController};
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> taskpipe::Result<()> {
//!     let handler = handler_fn(|url: String, ctx| async move {
//!         tokio::select! {
//!             _ = ctx.cancelled() => Err::<usize, BoxError>("cancelled".into()),
//!             _ = tokio::time::sleep(Duration::from_millis(300)) => Ok(url.len()),
//!         }
//!     });
//!     let controller = TaskController::new(PipelineConfig::from_env(), handler)?;
//!
//!     let task = Task::new("https://example.com".to_string())
//!         .with_timeout(Duration::from_secs(2))
//!         .with_cache_key("example.com");
//!     let len = controller.submit(task, "client-a", CancellationToken::new()).await?;
//!     println!("{len}");
//!
//!     controller.shutdown(Duration::from_secs(5)).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`controller`] | Submission, deadlines, cancellation and graceful shutdown |
//! | [`queue`] | Fixed-capacity FIFO with backpressure and close/drain |
//! | [`worker`] | Handler trait and the worker pool |
//! | [`task`] | Task, job, context and state types |
//! | [`resilience`] | Per-key token-bucket rate limiting |
//! | [`cache`] | Expiring key/value store |
//! | [`config`] | Pipeline configuration (code, env, JSON) |
//! | [`error`] | Unified error type |

pub mod cache;
pub mod config;
pub mod controller;
pub mod queue;
pub mod resilience;
pub mod task;
pub mod worker;

// Re-export main types for convenience
pub use config::PipelineConfig;
pub use controller::{PipelineSignals, PipelineStats, TaskController, TaskControllerBuilder};
pub use task::{JobHandle, Task, TaskContext, TaskId, TaskState};
pub use worker::{handler_fn, TaskHandler};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{BoxError, Error, ErrorContext};
