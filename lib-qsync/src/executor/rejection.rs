use std::{fmt, sync::Arc};

use super::{Job, ThreadPoolExecutor};
use crate::error::SyncError;

/// Custom handling for jobs the pool cannot take.
pub trait RejectedExecutionHandler<J: Job>: Send + Sync {
    fn rejected(&self, job: J, executor: &ThreadPoolExecutor<J>) -> Result<(), SyncError>;
}

/// What `execute` does when the pool is saturated or shut down.
pub enum RejectionPolicy<J: Job> {
    /// Fail with [`SyncError::Rejected`].
    Abort,
    /// Run the job on the submitting thread, unless the pool is shut down.
    CallerRuns,
    /// Drop the job silently.
    Discard,
    /// Drop the oldest queued job and retry, unless the pool is shut down.
    DiscardOldest,
    Custom(Arc<dyn RejectedExecutionHandler<J>>),
}

impl<J: Job> RejectionPolicy<J> {
    pub(crate) fn reject(&self, job: J, executor: &ThreadPoolExecutor<J>) -> Result<(), SyncError> {
        match self {
            RejectionPolicy::Abort => Err(SyncError::Rejected("executor saturated or shut down")),
            RejectionPolicy::CallerRuns => {
                if !executor.is_shutdown() {
                    job.run();
                } else {
                    job.cancel();
                }
                Ok(())
            }
            RejectionPolicy::Discard => {
                job.cancel();
                Ok(())
            }
            RejectionPolicy::DiscardOldest => {
                if executor.is_shutdown() {
                    job.cancel();
                    return Ok(());
                }
                if let Some(oldest) = executor.queue().poll() {
                    oldest.cancel();
                }
                executor.execute_job(job)
            }
            RejectionPolicy::Custom(handler) => handler.rejected(job, executor),
        }
    }
}

impl<J: Job> Default for RejectionPolicy<J> {
    fn default() -> Self {
        RejectionPolicy::Abort
    }
}

impl<J: Job> Clone for RejectionPolicy<J> {
    fn clone(&self) -> Self {
        match self {
            RejectionPolicy::Abort => RejectionPolicy::Abort,
            RejectionPolicy::CallerRuns => RejectionPolicy::CallerRuns,
            RejectionPolicy::Discard => RejectionPolicy::Discard,
            RejectionPolicy::DiscardOldest => RejectionPolicy::DiscardOldest,
            RejectionPolicy::Custom(handler) => RejectionPolicy::Custom(handler.clone()),
        }
    }
}

impl<J: Job> fmt::Debug for RejectionPolicy<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionPolicy::Abort => f.write_str("Abort"),
            RejectionPolicy::CallerRuns => f.write_str("CallerRuns"),
            RejectionPolicy::Discard => f.write_str("Discard"),
            RejectionPolicy::DiscardOldest => f.write_str("DiscardOldest"),
            RejectionPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
