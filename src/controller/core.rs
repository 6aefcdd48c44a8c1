use super::signals::PipelineSignals;
use super::stats::{AtomicPipelineStats, PipelineStats};
use super::TaskControllerBuilder;
use crate::cache::TtlCache;
use crate::config::PipelineConfig;
use crate::queue::BoundedQueue;
use crate::resilience::KeyedRateLimiter;
use crate::task::{Job, JobHandle, Task, TaskId, TaskState};
use crate::worker::{TaskHandler, WorkerPool};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
enum ShutdownOutcome {
    Drained,
    TimedOut {
        drain_timeout: Duration,
        outstanding: usize,
    },
}

impl ShutdownOutcome {
    fn to_result(self) -> Result<()> {
        match self {
            ShutdownOutcome::Drained => Ok(()),
            ShutdownOutcome::TimedOut {
                drain_timeout,
                outstanding,
            } => Err(Error::ShutdownTimeout {
                drain_timeout,
                outstanding,
            }),
        }
    }
}

enum Wake<T> {
    Reply(Result<T>),
    Canceled,
    Expired,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Submitter side of an admitted job. Records exactly one outcome for the task; if the `submit`
/// future is dropped before that happens, the job is cancelled and the cancellation recorded.
struct Pending<'a, R> {
    stats: &'a AtomicPipelineStats,
    handle: JobHandle<R>,
    settled: bool,
}

impl<'a, R> Pending<'a, R> {
    fn new(stats: &'a AtomicPipelineStats, handle: JobHandle<R>) -> Self {
        Self {
            stats,
            handle,
            settled: false,
        }
    }

    fn finish(&mut self, state: TaskState) {
        self.settled = true;
        debug!(task_id = %self.handle.task_id(), state = %state, "task finished");
        self.stats.record_terminal(state);
    }

    fn reject_closed(&mut self) {
        self.settled = true;
        self.stats.record_rejected_closed();
    }

    /// Cancel a job the submitter stopped waiting for. A still-queued job will be skipped; a
    /// running handler is signalled and left to return on its own.
    fn cancel(&mut self) {
        let was_queued = self.handle.cancel();
        let state = if was_queued || !self.handle.has_started() {
            TaskState::CanceledWhileQueued
        } else {
            TaskState::CanceledWhileRunning
        };
        self.finish(state);
    }

    fn give_up(&mut self, err: Error) -> Error {
        debug!(task_id = %self.handle.task_id(), reason = %err, "submitter gave up on task");
        self.cancel();
        err
    }
}

impl<R> Drop for Pending<'_, R> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(task_id = %self.handle.task_id(), "submission dropped before completion");
            self.cancel();
        }
    }
}

/// Single entry point tying rate limiting, caching, queueing and per-task deadlines together.
///
/// Cache and rate limiter are shared handles: collaborators may query or populate them
/// directly through [`TaskController::cache`] and [`TaskController::rate_limiter`].
pub struct TaskController<H: TaskHandler> {
    config: PipelineConfig,
    pool: WorkerPool<H>,
    rate_limiter: Arc<KeyedRateLimiter>,
    cache: Arc<TtlCache<String, H::Output>>,
    stats: AtomicPipelineStats,
    accepting: AtomicBool,
    lifecycle: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<ShutdownOutcome>>,
}

impl<H> TaskController<H>
where
    H: TaskHandler,
    H::Output: Clone + Sync,
{
    /// Build with `config` and default collaborators. Must be called inside a tokio runtime.
    pub fn new(config: PipelineConfig, handler: H) -> Result<Self> {
        TaskControllerBuilder::new().config(config).build(handler)
    }

    pub(crate) fn from_parts(
        config: PipelineConfig,
        handler: Arc<H>,
        rate_limiter: Arc<KeyedRateLimiter>,
        cache: Arc<TtlCache<String, H::Output>>,
    ) -> Self {
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let pool = WorkerPool::start(config.workers, queue, handler, config.max_concurrency);
        let lifecycle = CancellationToken::new();
        let sweeper = cache
            .config()
            .sweep_interval
            .map(|every| cache.spawn_sweeper(every, lifecycle.child_token()));
        info!(
            queue_capacity = config.queue_capacity,
            workers = config.workers,
            max_concurrency = ?config.max_concurrency,
            cache_sweeper = sweeper.is_some(),
            "task controller started"
        );

        Self {
            config,
            pool,
            rate_limiter,
            cache,
            stats: AtomicPipelineStats::new(),
            accepting: AtomicBool::new(true),
            lifecycle,
            sweeper: std::sync::Mutex::new(sweeper),
            shutdown: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TtlCache<String, H::Output>> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &Arc<KeyedRateLimiter> {
        &self.rate_limiter
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.to_stats()
    }

    pub fn signals(&self) -> PipelineSignals {
        PipelineSignals {
            accepting: self.is_accepting(),
            queue: self.pool.queue().snapshot(),
            pool: self.pool.snapshot(),
            rate_limit_keys: self.rate_limiter.tracked_keys(),
            cache_entries: self.cache.len(),
            cache: self.cache.stats(),
            stats: self.stats(),
        }
    }

    fn finish(&self, task_id: TaskId, state: TaskState) {
        debug!(task_id = %task_id, state = %state, "task finished");
        self.stats.record_terminal(state);
    }

    /// Run `task` through the pipeline and wait for its result.
    ///
    /// 1. A fresh cache hit for the task's cache key is returned without queueing or consuming
    ///    a rate-limit token.
    /// 2. Otherwise `identity` must be admitted by the rate limiter, else `Error::RateLimited`.
    /// 3. The job is pushed onto the bounded queue; this is where a full queue backpressures.
    /// 4. The result, cancellation of `ctx` and the task deadline race; the first wins. On
    ///    cancel or deadline a still-queued job is marked so workers skip it, and a running
    ///    handler sees its [`TaskContext`](crate::task::TaskContext) cancelled.
    /// 5. A successful result is stored under the cache key.
    ///
    /// Tasks without a deadline inherit `default_timeout` from the config when set.
    pub async fn submit(
        &self,
        task: Task<H::Payload>,
        identity: &str,
        ctx: CancellationToken,
    ) -> Result<H::Output> {
        let submitted_at = Instant::now();
        self.stats.record_submitted();
        if !self.is_accepting() {
            self.stats.record_rejected_closed();
            warn!(task_id = %task.id(), "submission rejected, controller is shutting down");
            return Err(Error::QueueClosed);
        }

        let (task_id, payload, deadline, cache_key) = task.into_parts();
        let deadline =
            deadline.or_else(|| self.config.default_timeout.map(|t| submitted_at + t));

        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                self.finish(task_id, TaskState::CacheHit);
                return Ok(hit);
            }
        }

        if !self.rate_limiter.allow(identity) {
            warn!(task_id = %task_id, key = identity, "submission rate limited");
            self.finish(task_id, TaskState::RateLimited);
            return Err(Error::RateLimited {
                key: identity.to_string(),
            });
        }

        if deadline.is_some_and(|d| d <= submitted_at) {
            self.finish(task_id, TaskState::CanceledWhileQueued);
            return Err(Error::Timeout { task_id });
        }

        let (job, handle) = Job::new(task_id, payload, deadline, self.pool.job_token());
        let mut pending = Pending::new(&self.stats, handle);
        let expiry = until(deadline);
        tokio::pin!(expiry);

        let pushed = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Canceled { task_id }),
            _ = &mut expiry => Err(Error::Timeout { task_id }),
            res = self.pool.queue().push(job) => res.map_err(|_| Error::QueueClosed),
        };
        if let Err(err) = pushed {
            if matches!(err, Error::QueueClosed) {
                pending.reject_closed();
                warn!(task_id = %task_id, "queue closed while waiting for space");
            } else {
                pending.finish(TaskState::CanceledWhileQueued);
            }
            return Err(err);
        }
        debug!(task_id = %task_id, key = identity, "task queued");

        let wake = tokio::select! {
            biased;
            reply = pending.handle.recv() => Wake::Reply(reply),
            _ = ctx.cancelled() => Wake::Canceled,
            _ = &mut expiry => Wake::Expired,
        };

        match wake {
            Wake::Reply(Ok(value)) => {
                self.stats.record_latency(submitted_at.elapsed());
                if let Some(key) = cache_key {
                    self.cache.set(key, value.clone());
                }
                pending.finish(TaskState::Completed);
                Ok(value)
            }
            Wake::Reply(Err(err)) => {
                let state = match &err {
                    Error::Handler { .. } => {
                        self.stats.record_latency(submitted_at.elapsed());
                        TaskState::Failed
                    }
                    Error::Timeout { .. } | Error::Canceled { .. } | Error::Abandoned { .. } => {
                        if pending.handle.has_started() {
                            TaskState::CanceledWhileRunning
                        } else {
                            TaskState::CanceledWhileQueued
                        }
                    }
                    _ => TaskState::Failed,
                };
                pending.finish(state);
                Err(err)
            }
            Wake::Canceled => Err(pending.give_up(Error::Canceled { task_id })),
            Wake::Expired => Err(pending.give_up(Error::Timeout { task_id })),
        }
    }

    /// Stop accepting submissions, close the queue and wait up to `drain_timeout` for queued and
    /// running work to finish.
    ///
    /// Work still outstanding when the window elapses is abandoned (its submitters receive
    /// `Error::Abandoned`) and this returns `Error::ShutdownTimeout`. Calling again returns the
    /// first call's outcome.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<()> {
        let mut outcome = self.shutdown.lock().await;
        if let Some(done) = *outcome {
            return done.to_result();
        }

        self.accepting.store(false, Ordering::Release);
        info!(
            drain_ms = drain_timeout.as_millis() as u64,
            queued = self.pool.queue().len(),
            running = self.pool.running(),
            "task controller shutting down"
        );

        let result = match self.pool.stop_within(drain_timeout).await {
            Ok(()) => ShutdownOutcome::Drained,
            Err(Error::ShutdownTimeout {
                drain_timeout,
                outstanding,
            }) => ShutdownOutcome::TimedOut {
                drain_timeout,
                outstanding,
            },
            Err(other) => return Err(other),
        };

        self.lifecycle.cancel();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        match result {
            ShutdownOutcome::Drained => info!("task controller shut down cleanly"),
            ShutdownOutcome::TimedOut { outstanding, .. } => {
                warn!(outstanding, "task controller shut down with abandoned work")
            }
        }
        *outcome = Some(result);
        result.to_result()
    }

    /// [`TaskController::shutdown`] with the configured drain window.
    pub async fn shutdown_default(&self) -> Result<()> {
        self.shutdown(self.config.drain_timeout).await
    }
}

impl<H: TaskHandler> Drop for TaskController<H> {
    fn drop(&mut self) {
        self.lifecycle.cancel();
    }
}

impl<H: TaskHandler> std::fmt::Debug for TaskController<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskController")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}
