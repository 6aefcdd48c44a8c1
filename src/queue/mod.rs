//! 有界队列模块：提供带背压和关闭/排空协议的 FIFO 队列。
//!
//! # Bounded Queue Module
//!
//! A fixed-capacity, multi-producer multi-consumer FIFO used as the dispatch point between
//! submitters and workers.
//!
//! ## Overview
//!
//! - **Backpressure**: [`BoundedQueue::push`] waits while the queue is full instead of buffering
//!   unboundedly; [`BoundedQueue::try_push`] is the fail-fast alternative.
//! - **Close + drain**: [`BoundedQueue::close`] rejects further pushes while items already
//!   enqueued are still delivered. [`BoundedQueue::pop`] returns `None` only once the queue is
//!   closed *and* empty, so consumers never need a per-consumer stop sentinel.
//! - **Ordering**: items are dequeued in insertion order.
//!
//! ## Example
//!
//! ```rust
//! use taskpipe::queue::BoundedQueue;
//!
//! # tokio_test::block_on(async {
//! let queue = BoundedQueue::new(2);
//! queue.push("a").await.unwrap();
//! queue.push("b").await.unwrap();
//! queue.close();
//!
//! assert_eq!(queue.pop().await, Some("a"));
//! assert_eq!(queue.pop().await, Some("b"));
//! assert_eq!(queue.pop().await, None);
//! # });
//! ```

mod bounded;

pub use bounded::{BoundedQueue, QueueClosed, QueueSnapshot, TryPushError};
