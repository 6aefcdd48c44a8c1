//! Bounded FIFO with async backpressure.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;

/// Returned by [`BoundedQueue::push`] once the queue is closed. Carries the rejected item.
#[derive(Error, PartialEq, Eq)]
#[error("queue closed")]
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueClosed").finish_non_exhaustive()
    }
}

/// Returned by [`BoundedQueue::try_push`].
#[derive(Error, PartialEq, Eq)]
pub enum TryPushError<T> {
    #[error("queue full")]
    Full(T),
    #[error("queue closed")]
    Closed(T),
}

impl<T> TryPushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TryPushError::Full(t) | TryPushError::Closed(t) => t,
        }
    }
}

impl<T> fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPushError::Full(_) => f.write_str("Full(..)"),
            TryPushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub len: usize,
    pub capacity: usize,
    pub high_water_mark: usize,
    pub closed: bool,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    high_water_mark: usize,
}

/// Fixed-capacity multi-producer multi-consumer FIFO.
///
/// The buffer and the closed flag live under one lock; blocked pushers and poppers park on two
/// [`Notify`]s that play the role of condition variables. A waiter always registers interest
/// before inspecting state, so a wake-up between the check and the park cannot be lost.
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

enum PopOutcome<T> {
    Item(T),
    Empty,
    Drained,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than zero");
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                high_water_mark: 0,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    // Queue state stays consistent across a panic in another holder (every mutation is a single
    // VecDeque call), so a poisoned lock is recovered rather than propagated.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push without waiting.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        {
            let mut st = self.lock();
            if st.closed {
                return Err(TryPushError::Closed(item));
            }
            if st.items.len() >= self.capacity {
                return Err(TryPushError::Full(item));
            }
            st.items.push_back(item);
            st.high_water_mark = st.high_water_mark.max(st.items.len());
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push, waiting for space while the queue is full.
    ///
    /// Fails with [`QueueClosed`] if the queue is closed before or while waiting.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut item = item;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(TryPushError::Closed(it)) => return Err(QueueClosed(it)),
                Err(TryPushError::Full(it)) => item = it,
            }
            notified.await;
        }
    }

    fn pop_locked(&self) -> PopOutcome<T> {
        let outcome = {
            let mut st = self.lock();
            match st.items.pop_front() {
                Some(item) => PopOutcome::Item(item),
                None if st.closed => PopOutcome::Drained,
                None => PopOutcome::Empty,
            }
        };
        if matches!(outcome, PopOutcome::Item(_)) {
            self.not_full.notify_one();
        }
        outcome
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<T> {
        match self.pop_locked() {
            PopOutcome::Item(item) => Some(item),
            PopOutcome::Empty | PopOutcome::Drained => None,
        }
    }

    /// Pop the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` only when the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.pop_locked() {
                PopOutcome::Item(item) => return Some(item),
                PopOutcome::Drained => return None,
                PopOutcome::Empty => {}
            }
            notified.await;
        }
    }

    /// Stop accepting pushes. Already-enqueued items remain poppable. Idempotent.
    pub fn close(&self) {
        let newly_closed = {
            let mut st = self.lock();
            !std::mem::replace(&mut st.closed, true)
        };
        if newly_closed {
            self.not_empty.notify_waiters();
            self.not_full.notify_waiters();
        }
    }

    /// Take every item still queued. Used to abandon work once draining gave up.
    pub fn drain_remaining(&self) -> Vec<T> {
        let drained: Vec<T> = self.lock().items.drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    /// Current occupancy (best-effort; may be stale by the time it is read).
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Largest occupancy observed since creation.
    pub fn high_water_mark(&self) -> usize {
        self.lock().high_water_mark
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let st = self.lock();
        QueueSnapshot {
            len: st.items.len(),
            capacity: self.capacity,
            high_water_mark: st.high_water_mark,
            closed: st.closed,
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("BoundedQueue")
            .field("len", &snap.len)
            .field("capacity", &snap.capacity)
            .field("closed", &snap.closed)
            .finish()
    }
}
