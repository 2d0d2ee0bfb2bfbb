use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("illegal argument: {0}")]
    IllegalArgument(&'static str),
    #[error("current thread does not hold the lock")]
    IllegalMonitorState,
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("interrupted while waiting")]
    Interrupted,
    #[error("timed out")]
    Timeout,
    #[error("barrier is broken")]
    BrokenBarrier,
    #[error("task rejected: {0}")]
    Rejected(&'static str),
    #[error("task was cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    ExecutionFailed(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
