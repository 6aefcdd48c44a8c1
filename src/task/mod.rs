//! 任务模型：任务、任务上下文与状态机。
//!
//! # Task Model
//!
//! A [`Task`] is what a caller submits; a [`Job`] is the form it takes inside the queue
//! (the task plus its one-shot result channel and cancellation token). Exactly one job exists per
//! submitted task.
//!
//! ## State machine
//!
//! ```text
//! Submitted ─┬─> CacheHit
//!            ├─> RateLimited
//!            └─> Queued ─┬─> Running ─┬─> Completed
//!                        │            ├─> Failed
//!                        │            └─> CanceledWhileRunning
//!                        └─> CanceledWhileQueued
//! ```

mod job;

pub use job::{Job, JobHandle};

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work submitted to the pipeline. Immutable once built.
#[derive(Debug, Clone)]
pub struct Task<P> {
    id: TaskId,
    payload: P,
    deadline: Option<Instant>,
    cache_key: Option<String>,
}

impl<P> Task<P> {
    pub fn new(payload: P) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            deadline: None,
            cache_key: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Absolute deadline after which the task is abandoned with `Error::Timeout`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    pub(crate) fn into_parts(self) -> (TaskId, P, Option<Instant>, Option<String>) {
        (self.id, self.payload, self.deadline, self.cache_key)
    }
}

/// Handed to a handler alongside the payload.
///
/// Cancellation is cooperative: long-running handlers should poll [`TaskContext::is_cancelled`]
/// or race their work against [`TaskContext::cancelled`] and return promptly once it fires.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TaskContext {
    pub(crate) fn new(task_id: TaskId, token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            task_id,
            token,
            deadline,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` when the task has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task is canceled, times out, or is abandoned at shutdown.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Lifecycle state of a task. Every state except `Submitted`, `Queued` and `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Submitted,
    CacheHit,
    RateLimited,
    Queued,
    Running,
    Completed,
    Failed,
    CanceledWhileRunning,
    CanceledWhileQueued,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TaskState::Submitted | TaskState::Queued | TaskState::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::CacheHit => "cache_hit",
            TaskState::RateLimited => "rate_limited",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::CanceledWhileRunning => "canceled_while_running",
            TaskState::CanceledWhileQueued => "canceled_while_queued",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let id = TaskId::new();
        let task = Task::new(7u32).with_id(id).with_cache_key("k");
        assert_eq!(task.id(), id);
        assert_eq!(*task.payload(), 7);
        assert_eq!(task.cache_key(), Some("k"));
        assert!(task.deadline().is_none());
    }

    #[test]
    fn test_task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Submitted.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        for s in [
            TaskState::CacheHit,
            TaskState::RateLimited,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::CanceledWhileRunning,
            TaskState::CanceledWhileQueued,
        ] {
            assert!(s.is_terminal(), "{} should be terminal", s);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_remaining_and_cancel() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new(
            TaskId::new(),
            token.clone(),
            Some(Instant::now() + Duration::from_secs(2)),
        );
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));

        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }
}
