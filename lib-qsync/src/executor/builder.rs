use std::{sync::Arc, time::Duration};

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationNanoSeconds};

use super::{
    pool::{default_thread_factory, PoolSettings},
    BoxedJob, ExecutionHooks, Job, RejectionPolicy, ThreadFactory, ThreadPoolExecutor,
};
use crate::{
    error::SyncError,
    queue::{BlockingQueue, LinkedBlockingQueue},
};

/// Sizing of a pool, loadable from any serde format.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub core_pool_size: usize,
    pub maximum_pool_size: usize,
    #[serde_as(as = "DurationNanoSeconds")]
    pub keep_alive: Duration,
    pub allow_core_thread_timeout: bool,
    /// Bound of the default work queue. Unbounded when absent.
    pub queue_capacity: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            core_pool_size: cpus,
            maximum_pool_size: cpus,
            keep_alive: Duration::from_secs(60),
            allow_core_thread_timeout: false,
            queue_capacity: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.maximum_pool_size == 0 {
            return Err(SyncError::IllegalArgument("maximum pool size must be positive"));
        }
        if self.maximum_pool_size < self.core_pool_size {
            return Err(SyncError::IllegalArgument(
                "maximum pool size is smaller than the core size",
            ));
        }
        if self.allow_core_thread_timeout && self.keep_alive.is_zero() {
            return Err(SyncError::IllegalArgument(
                "core threads must have nonzero keep alive times",
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(SyncError::IllegalArgument("queue capacity must be positive"));
        }
        Ok(())
    }
}

/// Assembles a [`ThreadPoolExecutor`].
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct ThreadPoolBuilder<J: Job = BoxedJob> {
    config: PoolConfig,
    #[derivative(Debug = "ignore")]
    queue: Option<Arc<dyn BlockingQueue<J>>>,
    #[derivative(Debug = "ignore")]
    thread_factory: Option<Arc<dyn ThreadFactory>>,
    rejection: RejectionPolicy<J>,
    #[derivative(Debug = "ignore")]
    hooks: Option<Arc<dyn ExecutionHooks>>,
}

impl ThreadPoolBuilder<BoxedJob> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<J: Job> Default for ThreadPoolBuilder<J> {
    fn default() -> Self {
        Self::from_config(PoolConfig::default())
    }
}

impl<J: Job> ThreadPoolBuilder<J> {
    pub fn from_config(config: PoolConfig) -> Self {
        Self {
            config,
            queue: None,
            thread_factory: None,
            rejection: RejectionPolicy::default(),
            hooks: None,
        }
    }

    pub fn core_pool_size(mut self, size: usize) -> Self {
        self.config.core_pool_size = size;
        self
    }

    pub fn maximum_pool_size(mut self, size: usize) -> Self {
        self.config.maximum_pool_size = size;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn allow_core_thread_timeout(mut self, allow: bool) -> Self {
        self.config.allow_core_thread_timeout = allow;
        self
    }

    /// Bounds the default queue. Ignored when a queue is supplied.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = Some(capacity);
        self
    }

    pub fn queue(self, queue: impl BlockingQueue<J> + 'static) -> Self {
        self.shared_queue(Arc::new(queue))
    }

    pub fn shared_queue(mut self, queue: Arc<dyn BlockingQueue<J>>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn thread_factory(mut self, factory: Arc<dyn ThreadFactory>) -> Self {
        self.thread_factory = Some(factory);
        self
    }

    pub fn rejection_policy(mut self, policy: RejectionPolicy<J>) -> Self {
        self.rejection = policy;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ExecutionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub(crate) fn settings(self) -> Result<PoolSettings<J>, SyncError> {
        self.config.validate()?;

        let queue: Arc<dyn BlockingQueue<J>> = match self.queue {
            Some(queue) => queue,
            None => match self.config.queue_capacity {
                Some(capacity) => Arc::new(LinkedBlockingQueue::with_capacity(capacity)?),
                None => Arc::new(LinkedBlockingQueue::new()),
            },
        };

        Ok(PoolSettings {
            core_pool_size: self.config.core_pool_size,
            maximum_pool_size: self.config.maximum_pool_size,
            keep_alive: self.config.keep_alive,
            allow_core_timeout: self.config.allow_core_thread_timeout,
            queue,
            thread_factory: self.thread_factory.unwrap_or_else(default_thread_factory),
            rejection: self.rejection,
            hooks: self.hooks,
        })
    }

    pub fn build(self) -> Result<ThreadPoolExecutor<J>, SyncError> {
        let settings = self.settings()?;
        log::debug!(
            "starting thread pool: core {}, max {}, keep alive {:?}",
            settings.core_pool_size,
            settings.maximum_pool_size,
            settings.keep_alive
        );
        Ok(ThreadPoolExecutor::from_settings(settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let config = PoolConfig {
            core_pool_size: 2,
            maximum_pool_size: 8,
            keep_alive: Duration::from_millis(1500),
            allow_core_thread_timeout: true,
            queue_capacity: Some(64),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"keep_alive\":1500000000"));
        assert_eq!(serde_json::from_str::<PoolConfig>(&json).unwrap(), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"core_pool_size": 1}"#).unwrap();
        assert_eq!(config.core_pool_size, 1);
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert_eq!(config.queue_capacity, None);
    }

    #[test]
    fn build_rejects_bad_sizes() {
        let err = ThreadPoolBuilder::new()
            .core_pool_size(4)
            .maximum_pool_size(2)
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::IllegalArgument(_)));

        assert!(ThreadPoolBuilder::new().maximum_pool_size(0).build().is_err());
        assert!(ThreadPoolBuilder::new()
            .keep_alive(Duration::ZERO)
            .allow_core_thread_timeout(true)
            .build()
            .is_err());
        assert!(ThreadPoolBuilder::new().queue_capacity(0).build().is_err());
    }

    #[test]
    fn bounded_default_queue() {
        let pool = ThreadPoolBuilder::new()
            .core_pool_size(1)
            .maximum_pool_size(1)
            .queue_capacity(3)
            .build()
            .unwrap();
        assert_eq!(pool.queue().remaining_capacity(), 3);
    }
}
