//! Queue-side representation of a task.

use super::{Task, TaskContext, TaskId};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELED: u8 = 2;
const FINISHED: u8 = 3;

/// Ownership handshake between the submitter and the worker that dequeues the job.
///
/// Only one side wins the `Queued` slot: either a worker moves it to `Running`, or the submitter
/// moves it to `Canceled` and the worker later skips it.
#[derive(Debug)]
pub(crate) struct JobState {
    state: AtomicU8,
    started: AtomicBool,
}

impl JobState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(QUEUED),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn try_start(&self) -> bool {
        let won = self
            .state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.started.store(true, Ordering::Release);
        }
        won
    }

    pub(crate) fn try_cancel_queued(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish(&self) {
        self.state.store(FINISHED, Ordering::Release);
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.state.load(Ordering::Acquire) == QUEUED
    }

    /// Whether a worker ever moved the job to `Running`.
    pub(crate) fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// A task plus its result channel, owned by the queue until dequeued and then by exactly one
/// worker until completion.
pub struct Job<P, R> {
    task_id: TaskId,
    payload: P,
    deadline: Option<Instant>,
    token: CancellationToken,
    state: Arc<JobState>,
    reply: oneshot::Sender<Result<R>>,
    enqueued_at: Instant,
}

impl<P, R> Job<P, R> {
    /// Wrap `task` for dispatch. `token` should come from [`crate::worker::WorkerPool::job_token`]
    /// so that pool shutdown reaches the job.
    pub fn from_task(task: Task<P>, token: CancellationToken) -> (Self, JobHandle<R>) {
        let (task_id, payload, deadline, _) = task.into_parts();
        Self::new(task_id, payload, deadline, token)
    }

    pub(crate) fn new(
        task_id: TaskId,
        payload: P,
        deadline: Option<Instant>,
        token: CancellationToken,
    ) -> (Self, JobHandle<R>) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(JobState::new());
        let job = Self {
            task_id,
            payload,
            deadline,
            token: token.clone(),
            state: state.clone(),
            reply: tx,
            enqueued_at: Instant::now(),
        };
        let handle = JobHandle {
            task_id,
            token,
            state,
            reply: rx,
            received: false,
        };
        (job, handle)
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn state(&self) -> &JobState {
        &self.state
    }

    /// Split into what the handler needs and the reply side kept by the worker.
    pub(crate) fn into_execution(self) -> (P, TaskContext, JobReply<R>) {
        let ctx = TaskContext::new(self.task_id, self.token, self.deadline);
        let reply = JobReply {
            state: self.state,
            reply: self.reply,
        };
        (self.payload, ctx, reply)
    }

    /// Resolve the job without running it.
    pub(crate) fn skip(self, err: Error) {
        self.state.finish();
        let _ = self.reply.send(Err(err));
    }
}

/// Worker-held reply half of a running job.
pub(crate) struct JobReply<R> {
    state: Arc<JobState>,
    reply: oneshot::Sender<Result<R>>,
}

impl<R> JobReply<R> {
    pub(crate) fn send(self, result: Result<R>) {
        self.state.finish();
        // The submitter may already have given up (cancel / timeout); that is not an error.
        let _ = self.reply.send(result);
    }
}

/// Submitter-held half of a job.
///
/// Dropping the handle before the reply was received cancels the job, so a submitter that stops
/// waiting never leaves work behind that still runs.
pub struct JobHandle<R> {
    task_id: TaskId,
    token: CancellationToken,
    state: Arc<JobState>,
    reply: oneshot::Receiver<Result<R>>,
    received: bool,
}

impl<R> JobHandle<R> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Signal the handler to abandon work. A job that has not been dequeued yet is skipped.
    ///
    /// Returns `true` when the job was still queued, i.e. it will never run.
    pub fn cancel(&self) -> bool {
        let was_queued = self.state.try_cancel_queued();
        self.token.cancel();
        was_queued
    }

    /// Wait for the worker's reply. A dropped job (abandoned at shutdown) surfaces as
    /// `Error::Abandoned`.
    pub async fn wait(mut self) -> Result<R> {
        self.recv().await
    }

    /// Cancel-safe receive of the reply; the handle stays usable if this future is dropped.
    pub(crate) async fn recv(&mut self) -> Result<R> {
        let reply = (&mut self.reply).await;
        self.received = true;
        reply.unwrap_or(Err(Error::Abandoned {
            task_id: self.task_id,
        }))
    }

    pub(crate) fn has_started(&self) -> bool {
        self.state.has_started()
    }
}

impl<R> Drop for JobHandle<R> {
    fn drop(&mut self) {
        if !self.received {
            self.cancel();
        }
    }
}
