use super::TaskController;
use crate::cache::TtlCache;
use crate::config::PipelineConfig;
use crate::resilience::KeyedRateLimiter;
use crate::worker::TaskHandler;
use crate::Result;
use std::sync::Arc;

/// Builder for [`TaskController`].
///
/// `O` is the handler's output type; it is fixed by an injected cache or by [`build`].
///
/// [`build`]: TaskControllerBuilder::build
pub struct TaskControllerBuilder<O> {
    config: PipelineConfig,
    rate_limiter: Option<Arc<KeyedRateLimiter>>,
    cache: Option<Arc<TtlCache<String, O>>>,
}

impl<O> TaskControllerBuilder<O>
where
    O: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            rate_limiter: None,
            cache: None,
        }
    }

    /// Start from `TASKPIPE_*` environment variables instead of the defaults.
    pub fn from_env() -> Self {
        Self::new().config(PipelineConfig::from_env())
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Cap concurrently running handlers independently of the worker count.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.config.max_concurrency = Some(limit);
        self
    }

    /// Share an existing limiter (e.g. one also consulted by other entry points).
    ///
    /// Its own configuration wins over `config.rate_limit`.
    pub fn rate_limiter(mut self, limiter: Arc<KeyedRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Share an existing cache. Its own configuration (TTL, cap, sweep interval) wins over
    /// `config.cache`.
    pub fn cache(mut self, cache: Arc<TtlCache<String, O>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate the configuration, start the worker pool and, when configured, the cache
    /// sweeper.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build<H>(self, handler: H) -> Result<TaskController<H>>
    where
        H: TaskHandler<Output = O>,
    {
        self.build_shared(Arc::new(handler))
    }

    /// Like [`TaskControllerBuilder::build`] for a handler that is already shared.
    pub fn build_shared<H>(self, handler: Arc<H>) -> Result<TaskController<H>>
    where
        H: TaskHandler<Output = O>,
    {
        self.config.validate()?;
        if let Some(cache) = &self.cache {
            cache.config().validate()?;
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.config().validate()?;
        }

        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(KeyedRateLimiter::new(self.config.rate_limit.clone())));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(TtlCache::new(self.config.cache.clone())));
        Ok(TaskController::from_parts(
            self.config,
            handler,
            rate_limiter,
            cache,
        ))
    }
}

impl<O> Default for TaskControllerBuilder<O>
where
    O: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::resilience::RateLimiterConfig;
    use crate::worker::handler_fn;
    use crate::{BoxError, Error};
    use std::time::Duration;

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let handler = handler_fn(|n: u8, _ctx| async move { Ok::<_, BoxError>(n) });
        let res = TaskControllerBuilder::new().workers(0).build(handler);
        assert!(matches!(res, Err(Error::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_injected_collaborators_are_shared() {
        let limiter = Arc::new(KeyedRateLimiter::new(
            RateLimiterConfig::new().with_capacity(3),
        ));
        let cache = Arc::new(TtlCache::new(
            CacheConfig::new().with_ttl(Duration::from_secs(5)),
        ));
        cache.set("warm".to_string(), 42u64);

        let handler = handler_fn(|n: u64, _ctx| async move { Ok::<_, BoxError>(n) });
        let controller = TaskControllerBuilder::new()
            .queue_capacity(2)
            .workers(1)
            .max_concurrency(1)
            .rate_limiter(limiter.clone())
            .cache(cache.clone())
            .build(handler)
            .unwrap();

        assert!(Arc::ptr_eq(controller.cache(), &cache));
        assert!(Arc::ptr_eq(controller.rate_limiter(), &limiter));
        assert_eq!(controller.signals().queue.capacity, 2);
        assert_eq!(controller.signals().pool.workers, 1);
        controller.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
