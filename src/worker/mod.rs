//! 工作池模块：固定数量的执行者从有界队列拉取任务并执行。
//!
//! # Worker Module
//!
//! Executors that pull jobs from a [`BoundedQueue`](crate::queue::BoundedQueue) and run a
//! [`TaskHandler`] on each.
//!
//! ## Overview
//!
//! - `n` workers run as tokio tasks; an optional semaphore caps running handlers at `k`
//! - Handler errors and panics are contained per job and reported to that job's submitter
//! - Stopping closes the queue, lets the workers drain it, then joins them
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TaskHandler`] | The work executed for each job |
//! | [`handler_fn`] | Adapts an async closure into a handler |
//! | [`WorkerPool`] | Spawns, throttles and joins the workers |
//! | [`PoolSnapshot`] | Point-in-time pool counters |
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use taskpipe::queue::BoundedQueue;
//! use taskpipe::task::{Job, Task};
//! use taskpipe::worker::{handler_fn, WorkerPool};
//! use taskpipe::BoxError;
//!
//! # tokio_test::block_on(async {
//! let queue = Arc::new(BoundedQueue::new(8));
//! let handler = handler_fn(|s: String, _ctx| async move { Ok::<_, BoxError>(s.len()) });
//! let pool = WorkerPool::start(2, queue, Arc::new(handler), Some(1));
//!
//! let (job, handle) = Job::from_task(Task::new("hello".to_string()), pool.job_token());
//! pool.queue().push(job).await.unwrap();
//! assert_eq!(handle.wait().await.unwrap(), 5);
//! pool.stop().await;
//! # });
//! ```

mod handler;
mod pool;

pub use handler::{handler_fn, FnHandler, TaskHandler};
pub use pool::{InflightSnapshot, JobQueue, PoolSnapshot, WorkerPool};
