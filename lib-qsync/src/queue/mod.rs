//! Blocking queues built on [`ReentrantLock`](crate::locks::ReentrantLock)
//! and its conditions.

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::{deadline::Deadline, error::SyncError, locks::Condition};

mod array;
mod delay;
mod linked;
mod priority;
mod synchronous;

pub use array::ArrayBlockingQueue;
pub use delay::{DelayQueue, Delayed, DelayedItem};
pub(crate) use delay::expiry_after;
pub use linked::LinkedBlockingQueue;
pub use priority::PriorityBlockingQueue;
pub use synchronous::SynchronousQueue;

/// Why an insertion failed. The rejected element is handed back.
#[derive(Error, PartialEq, Eq)]
pub enum OfferError<T> {
    #[error("queue is full")]
    Full(T),
    #[error("timed out waiting for space")]
    Timeout(T),
    #[error("interrupted while waiting for space")]
    Interrupted(T),
}

impl<T> OfferError<T> {
    pub fn into_inner(self) -> T {
        match self {
            OfferError::Full(item) | OfferError::Timeout(item) | OfferError::Interrupted(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, OfferError::Full(_))
    }
}

impl<T> fmt::Debug for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfferError::Full(_) => f.write_str("Full(..)"),
            OfferError::Timeout(_) => f.write_str("Timeout(..)"),
            OfferError::Interrupted(_) => f.write_str("Interrupted(..)"),
        }
    }
}

impl<T> From<OfferError<T>> for SyncError {
    fn from(err: OfferError<T>) -> Self {
        match err {
            OfferError::Full(_) => SyncError::IllegalState("queue full"),
            OfferError::Timeout(_) => SyncError::Timeout,
            OfferError::Interrupted(_) => SyncError::Interrupted,
        }
    }
}

/// A FIFO-ish queue whose consumers can block until an element arrives and
/// whose producers can block until space frees up.
pub trait BlockingQueue<T>: Send + Sync {
    /// Inserts without blocking.
    fn offer(&self, item: T) -> Result<(), OfferError<T>>;

    fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), OfferError<T>>;

    /// Inserts, waiting for space if necessary.
    fn put(&self, item: T) -> Result<(), OfferError<T>>;

    fn poll(&self) -> Option<T>;

    fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>, SyncError>;

    /// Removes the head, waiting for one to become available.
    fn take(&self) -> Result<T, SyncError>;

    fn len(&self) -> usize;

    fn remaining_capacity(&self) -> usize;

    /// Moves up to `max` available elements into `sink`.
    fn drain_to_max(&self, sink: &mut Vec<T>, max: usize) -> usize;

    /// Removes and returns every element matching `pred`.
    fn remove_where(&self, pred: &mut dyn FnMut(&T) -> bool) -> Vec<T>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&self, item: T) -> Result<(), SyncError> {
        self.offer(item).map_err(SyncError::from)
    }

    fn drain_to(&self, sink: &mut Vec<T>) -> usize {
        self.drain_to_max(sink, usize::MAX)
    }
}

/// Signals a condition whose lock the caller holds.
fn notify(condition: &Condition) {
    let signalled = condition.signal();
    debug_assert!(signalled.is_ok());
}

fn notify_all(condition: &Condition) {
    let signalled = condition.signal_all();
    debug_assert!(signalled.is_ok());
}

/// One bounded wait on `condition`. `Ok(false)` once the deadline passed.
fn wait_until(condition: &Condition, deadline: Deadline) -> Result<bool, SyncError> {
    match deadline.remaining() {
        Some(left) if left.is_zero() => Ok(false),
        Some(left) => condition.wait_for(left).map(|_| true),
        None => condition.wait().map(|_| true),
    }
}
