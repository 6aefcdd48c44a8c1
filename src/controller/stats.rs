//! Per-terminal-state counters for the controller.

use crate::task::TaskState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time counters. Every submission that passes the shutdown gate lands in exactly one
/// terminal bucket; submissions rejected because the controller is closing are counted in
/// `rejected_closed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub cache_hits: u64,
    pub rate_limited: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled_while_queued: u64,
    pub canceled_while_running: u64,
    pub rejected_closed: u64,
    /// Mean submit-to-result latency over completed and failed tasks.
    pub mean_latency: Option<Duration>,
}

impl PipelineStats {
    pub fn count(&self, state: TaskState) -> u64 {
        match state {
            TaskState::CacheHit => self.cache_hits,
            TaskState::RateLimited => self.rate_limited,
            TaskState::Completed => self.completed,
            TaskState::Failed => self.failed,
            TaskState::CanceledWhileQueued => self.canceled_while_queued,
            TaskState::CanceledWhileRunning => self.canceled_while_running,
            TaskState::Submitted | TaskState::Queued | TaskState::Running => 0,
        }
    }

    /// Tasks that reached a terminal state.
    pub fn terminal(&self) -> u64 {
        self.cache_hits
            + self.rate_limited
            + self.completed
            + self.failed
            + self.canceled_while_queued
            + self.canceled_while_running
    }

    /// Admitted submissions still waiting on a result.
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.rejected_closed)
            .saturating_sub(self.terminal())
    }
}

pub(crate) struct AtomicPipelineStats {
    submitted: AtomicU64,
    cache_hits: AtomicU64,
    rate_limited: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    canceled_while_queued: AtomicU64,
    canceled_while_running: AtomicU64,
    rejected_closed: AtomicU64,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
}

impl AtomicPipelineStats {
    pub(crate) fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            canceled_while_queued: AtomicU64::new(0),
            canceled_while_running: AtomicU64::new(0),
            rejected_closed: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_closed(&self) {
        self.rejected_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_terminal(&self, state: TaskState) {
        let counter = match state {
            TaskState::CacheHit => &self.cache_hits,
            TaskState::RateLimited => &self.rate_limited,
            TaskState::Completed => &self.completed,
            TaskState::Failed => &self.failed,
            TaskState::CanceledWhileQueued => &self.canceled_while_queued,
            TaskState::CanceledWhileRunning => &self.canceled_while_running,
            TaskState::Submitted | TaskState::Queued | TaskState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn to_stats(&self) -> PipelineStats {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let mean_latency = (samples > 0)
            .then(|| Duration::from_micros(self.latency_micros.load(Ordering::Relaxed) / samples));
        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled_while_queued: self.canceled_while_queued.load(Ordering::Relaxed),
            canceled_while_running: self.canceled_while_running.load(Ordering::Relaxed),
            rejected_closed: self.rejected_closed.load(Ordering::Relaxed),
            mean_latency,
        }
    }
}
