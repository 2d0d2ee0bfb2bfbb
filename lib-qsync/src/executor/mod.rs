//! Thread pools: a queue-fed worker pool with pluggable rejection, result
//! futures, bulk invocation and delayed or periodic scheduling.

mod builder;
mod factory;
mod future;
mod job;
mod pool;
mod rejection;
mod scheduled;
mod service;

pub use builder::{PoolConfig, ThreadPoolBuilder};
pub use factory::{DefaultThreadFactory, ThreadFactory};
pub use future::{FutureTask, TaskFuture};
pub use job::{BoxedJob, Job, Runnable};
pub use pool::{ExecutionHooks, RunState, ThreadPoolExecutor};
pub use rejection::{RejectedExecutionHandler, RejectionPolicy};
pub use scheduled::{ScheduledFuture, ScheduledJob, ScheduledThreadPool};
pub use service::ExecutorService;
