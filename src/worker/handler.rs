//! Task handler abstraction.

use crate::error::BoxError;
use crate::task::TaskContext;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// The work a pool executes for each job.
///
/// Returning `Err` fails only the current task; the error reaches the submitter wrapped in
/// `Error::Handler`. A panic is caught at the worker boundary and reported the same way.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Payload: Send + 'static;
    type Output: Send + 'static;

    async fn handle(
        &self,
        payload: Self::Payload,
        ctx: TaskContext,
    ) -> Result<Self::Output, BoxError>;
}

/// Adapter returned by [`handler_fn`].
pub struct FnHandler<F, P, R> {
    f: F,
    _marker: PhantomData<fn(P) -> R>,
}

/// Build a [`TaskHandler`] from an async closure.
///
/// ```rust
/// use taskpipe::worker::handler_fn;
/// use taskpipe::BoxError;
///
/// let handler = handler_fn(|n: u64, _ctx| async move { Ok::<_, BoxError>(n * 2) });
/// # let _ = handler;
/// ```
pub fn handler_fn<P, R, F, Fut>(f: F) -> FnHandler<F, P, R>
where
    F: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    P: Send + 'static,
    R: Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<P, R, F, Fut> TaskHandler for FnHandler<F, P, R>
where
    F: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    P: Send + 'static,
    R: Send + 'static,
{
    type Payload = P;
    type Output = R;

    async fn handle(&self, payload: P, ctx: TaskContext) -> Result<R, BoxError> {
        (self.f)(payload, ctx).await
    }
}
