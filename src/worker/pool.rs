//! Fixed-size worker pool.

use super::handler::TaskHandler;
use crate::error::HandlerPanic;
use crate::queue::BoundedQueue;
use crate::task::Job;
use crate::{Error, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queue type a pool for handler `H` consumes.
pub type JobQueue<H> =
    BoundedQueue<Job<<H as TaskHandler>::Payload, <H as TaskHandler>::Output>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightSnapshot {
    pub max: usize,
    pub available: usize,
    pub in_use: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub workers: usize,
    /// Handlers executing right now.
    pub running: usize,
    /// Present when a concurrency limit is configured.
    pub inflight: Option<InflightSnapshot>,
    /// Jobs whose handler ran to completion (success, error or panic).
    pub processed: u64,
    /// Jobs dequeued but never run (canceled, expired or abandoned).
    pub skipped: u64,
    pub panics: u64,
}

struct Shared {
    root: CancellationToken,
    abandoned: AtomicBool,
    running: AtomicUsize,
    processed: AtomicU64,
    skipped: AtomicU64,
    panics: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            abandoned: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        }
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

/// Decrements the running counter even when the worker task is aborted mid-handler.
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// `n` workers pulling jobs from a shared [`BoundedQueue`], optionally throttled by a semaphore
/// so that at most `k` handlers run at once even when `n > k`.
///
/// - A handler error or panic fails only its own job; the worker moves on
/// - Jobs canceled (or expired) while still queued are skipped without running
/// - [`WorkerPool::stop`] closes the queue, lets workers drain it and joins them
pub struct WorkerPool<H: TaskHandler> {
    queue: Arc<JobQueue<H>>,
    shared: Arc<Shared>,
    workers: Mutex<JoinSet<()>>,
    worker_count: usize,
    limiter: Option<Arc<Semaphore>>,
    max_concurrency: Option<usize>,
}

impl<H: TaskHandler> WorkerPool<H> {
    /// Spawn `workers` executors on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, if `workers` is zero, or if `max_concurrency`
    /// is `Some(0)`.
    pub fn start(
        workers: usize,
        queue: Arc<JobQueue<H>>,
        handler: Arc<H>,
        max_concurrency: Option<usize>,
    ) -> Self {
        assert!(workers > 0, "worker count must be greater than zero");
        assert!(
            max_concurrency != Some(0),
            "concurrency limit must be greater than zero"
        );

        let shared = Arc::new(Shared::new());
        let limiter = max_concurrency.map(|k| Arc::new(Semaphore::new(k)));
        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(run_worker(
                id,
                queue.clone(),
                handler.clone(),
                limiter.clone(),
                shared.clone(),
            ));
        }
        info!(workers, ?max_concurrency, "worker pool started");

        Self {
            queue,
            shared,
            workers: Mutex::new(set),
            worker_count: workers,
            limiter,
            max_concurrency,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue<H>> {
        &self.queue
    }

    /// Token for a new job. Cancelled when the pool abandons outstanding work.
    pub fn job_token(&self) -> CancellationToken {
        self.shared.root.child_token()
    }

    pub fn workers(&self) -> usize {
        self.worker_count
    }

    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn available_permits(&self) -> Option<usize> {
        self.limiter.as_ref().map(|s| s.available_permits())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inflight = self.limiter.as_ref().and_then(|sem| {
            let max = self.max_concurrency?;
            let available = sem.available_permits();
            Some(InflightSnapshot {
                max,
                available,
                in_use: max.saturating_sub(available),
            })
        });
        PoolSnapshot {
            workers: self.worker_count,
            running: self.running(),
            inflight,
            processed: self.shared.processed.load(Ordering::Relaxed),
            skipped: self.shared.skipped.load(Ordering::Relaxed),
            panics: self.shared.panics.load(Ordering::Relaxed),
        }
    }

    async fn join_all(set: &mut JoinSet<()>) {
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    warn!("worker task panicked outside a handler");
                }
            }
        }
    }

    /// Close the queue and wait for every worker to drain it and exit.
    pub async fn stop(&self) {
        self.queue.close();
        let mut workers = self.workers.lock().await;
        Self::join_all(&mut workers).await;
        info!("worker pool stopped");
    }

    /// Like [`WorkerPool::stop`], bounded by `drain`.
    ///
    /// When the window elapses every job token is cancelled, workers are aborted and jobs still
    /// queued are resolved with `Error::Abandoned`. Returns `Error::ShutdownTimeout` carrying
    /// the number of jobs that were queued or running at expiry.
    pub async fn stop_within(&self, drain: Duration) -> Result<()> {
        self.queue.close();
        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(drain, Self::join_all(&mut workers)).await;
        if drained.is_ok() {
            info!("worker pool stopped");
            return Ok(());
        }

        let outstanding = self.queue.len() + self.running();
        warn!(
            outstanding,
            drain_ms = drain.as_millis() as u64,
            "drain window elapsed, abandoning outstanding jobs"
        );
        self.shared.abandoned.store(true, Ordering::Release);
        self.shared.root.cancel();
        workers.abort_all();
        Self::join_all(&mut workers).await;
        for job in self.queue.drain_remaining() {
            let task_id = job.task_id();
            job.skip(Error::Abandoned { task_id });
        }
        Err(Error::ShutdownTimeout {
            drain_timeout: drain,
            outstanding,
        })
    }
}

impl<H: TaskHandler> std::fmt::Debug for WorkerPool<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count)
            .field("max_concurrency", &self.max_concurrency)
            .field("running", &self.running())
            .finish()
    }
}

async fn run_worker<H: TaskHandler>(
    id: usize,
    queue: Arc<JobQueue<H>>,
    handler: Arc<H>,
    limiter: Option<Arc<Semaphore>>,
    shared: Arc<Shared>,
) {
    debug!(worker = id, "worker started");
    while let Some(job) = queue.pop().await {
        process_job(id, job, handler.as_ref(), limiter.as_ref(), &shared).await;
    }
    debug!(worker = id, "queue closed and drained, worker exiting");
}

fn skip_error<P, R>(job: &Job<P, R>, shared: &Shared) -> Error {
    let task_id = job.task_id();
    if shared.is_abandoned() {
        Error::Abandoned { task_id }
    } else if job.is_expired(Instant::now()) {
        Error::Timeout { task_id }
    } else {
        Error::Canceled { task_id }
    }
}

fn skip<P, R>(worker: usize, job: Job<P, R>, shared: &Shared) {
    // Claim the queued slot so a late cancel from the submitter sees a settled state.
    job.state().try_cancel_queued();
    let err = skip_error(&job, shared);
    debug!(worker, task_id = %job.task_id(), reason = %err, "skipping job");
    shared.skipped.fetch_add(1, Ordering::Relaxed);
    job.skip(err);
}

fn should_skip<P, R>(job: &Job<P, R>) -> bool {
    job.token().is_cancelled() || job.is_expired(Instant::now()) || !job.state().is_queued()
}

async fn process_job<H: TaskHandler>(
    worker: usize,
    job: Job<H::Payload, H::Output>,
    handler: &H,
    limiter: Option<&Arc<Semaphore>>,
    shared: &Shared,
) {
    if should_skip(&job) {
        return skip(worker, job, shared);
    }

    let token = job.token().clone();
    let _permit = match limiter {
        None => None,
        Some(sem) => tokio::select! {
            biased;
            _ = token.cancelled() => return skip(worker, job, shared),
            permit = Arc::clone(sem).acquire_owned() => permit.ok(),
        },
    };

    if job.is_expired(Instant::now()) || !job.state().try_start() {
        return skip(worker, job, shared);
    }

    let task_id = job.task_id();
    let waited = job.enqueued_at().elapsed();
    let (payload, ctx, reply) = job.into_execution();
    debug!(worker, task_id = %task_id, waited_ms = waited.as_millis() as u64, "running job");

    let outcome = {
        let _running = RunningGuard::enter(&shared.running);
        AssertUnwindSafe(handler.handle(payload, ctx))
            .catch_unwind()
            .await
    };
    shared.processed.fetch_add(1, Ordering::Relaxed);

    let result = match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => {
            if token.is_cancelled() && shared.is_abandoned() {
                Err(Error::Abandoned { task_id })
            } else {
                debug!(worker, task_id = %task_id, error = %source, "handler failed");
                Err(Error::Handler { task_id, source })
            }
        }
        Err(panic) => {
            shared.panics.fetch_add(1, Ordering::Relaxed);
            let panic = HandlerPanic::from_payload(panic);
            warn!(worker, task_id = %task_id, message = %panic.message, "handler panicked, worker continues");
            Err(Error::Handler {
                task_id,
                source: Box::new(panic),
            })
        }
    };
    reply.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskContext};
    use crate::worker::handler_fn;
    use crate::BoxError;

    fn doubling_pool(
        workers: usize,
        capacity: usize,
    ) -> WorkerPool<impl TaskHandler<Payload = u64, Output = u64>> {
        let queue = Arc::new(BoundedQueue::new(capacity));
        let handler = handler_fn(|n: u64, _ctx: TaskContext| async move {
            if n == 13 {
                return Err::<u64, BoxError>("unlucky".into());
            }
            if n == 99 {
                panic!("ninety-nine");
            }
            Ok(n * 2)
        });
        WorkerPool::start(workers, queue, Arc::new(handler), None)
    }

    #[tokio::test]
    async fn test_results_reach_submitters() {
        let pool = doubling_pool(2, 4);
        let mut handles = Vec::new();
        for n in 0..4u64 {
            let (job, handle) = Job::from_task(Task::new(n), pool.job_token());
            pool.queue().push(job).await.unwrap();
            handles.push(handle);
        }
        for (n, h) in handles.into_iter().enumerate() {
            assert_eq!(h.wait().await.unwrap(), n as u64 * 2);
        }
        pool.stop().await;
        assert_eq!(pool.snapshot().processed, 4);
    }

    #[tokio::test]
    async fn test_error_and_panic_do_not_kill_pool() {
        let pool = doubling_pool(1, 4);
        let mut handles = Vec::new();
        for n in [13u64, 99, 5] {
            let (job, handle) = Job::from_task(Task::new(n), pool.job_token());
            pool.queue().push(job).await.unwrap();
            handles.push(handle);
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.wait().await);
        }

        match &results[0] {
            Err(Error::Handler { source, .. }) => assert_eq!(source.to_string(), "unlucky"),
            other => panic!("unexpected {:?}", other),
        }
        match &results[1] {
            Err(Error::Handler { source, .. }) => {
                assert!(source.to_string().contains("ninety-nine"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(results[2].as_ref().unwrap(), &10);

        pool.stop().await;
        let snap = pool.snapshot();
        assert_eq!(snap.panics, 1);
        assert_eq!(snap.running, 0);
    }

    #[tokio::test]
    async fn test_canceled_queued_job_is_skipped() {
        let queue = Arc::new(BoundedQueue::new(4));
        let ran = Arc::new(AtomicUsize::new(0));
        let handler = {
            let ran = ran.clone();
            handler_fn(move |_: (), _ctx| {
                let ran = ran.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            })
        };
        // Enqueue before any worker exists so the cancel deterministically wins.
        let root = CancellationToken::new();
        let (job, handle) = Job::from_task(Task::new(()), root.child_token());
        queue.push(job).await.unwrap();
        assert!(handle.cancel());

        let pool = WorkerPool::start(1, queue, Arc::new(handler), None);
        let id = handle.task_id();
        match handle.wait().await {
            Err(Error::Canceled { task_id }) => assert_eq!(task_id, id),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        pool.stop().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(pool.snapshot().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_job_is_skipped_with_timeout() {
        let queue = Arc::new(BoundedQueue::new(4));
        let (job, handle) = Job::<u64, u64>::from_task(
            Task::new(1).with_timeout(Duration::from_millis(1)),
            CancellationToken::new(),
        );
        queue.push(job).await.unwrap();
        tokio::time::advance(Duration::from_millis(2)).await;

        let handler = handler_fn(|n: u64, _ctx| async move { Ok::<_, BoxError>(n) });
        let pool = WorkerPool::start(1, queue, Arc::new(handler), None);
        assert!(matches!(handle.wait().await, Err(Error::Timeout { .. })));
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_within_abandons_stuck_work() {
        let queue = Arc::new(BoundedQueue::new(4));
        // ignores cancellation entirely
        let handler = handler_fn(|_: (), _ctx| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, BoxError>(())
        });
        let pool = WorkerPool::start(1, queue, Arc::new(handler), None);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let (job, handle) = Job::from_task(Task::new(()), pool.job_token());
            pool.queue().push(job).await.unwrap();
            handles.push(handle);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.running(), 1);

        match pool.stop_within(Duration::from_millis(100)).await {
            Err(Error::ShutdownTimeout { outstanding, .. }) => assert_eq!(outstanding, 3),
            other => panic!("unexpected {:?}", other),
        }
        for h in handles {
            assert!(matches!(h.wait().await, Err(Error::Abandoned { .. })));
        }
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let pool = doubling_pool(2, 2);
        pool.stop().await;
        pool.stop().await;
        assert!(pool.stop_within(Duration::from_millis(10)).await.is_ok());
        assert!(pool.queue().is_closed());
    }
}
