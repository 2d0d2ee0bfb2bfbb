//! Blocking synchronizers built on one queued-synchronizer core: locks,
//! semaphores, latches, barriers, blocking queues and thread pools.

pub mod barrier;
pub mod deadline;
pub mod error;
pub mod executor;
pub mod locks;
pub mod parker;
pub mod queue;
pub mod spin_lock;
pub mod synchronizer;
pub mod thread;

mod guarded;
#[cfg(test)]
mod testing;
#[cfg(test)]
mod unit_test;

pub use barrier::CyclicBarrier;
pub use error::{Result, SyncError};
pub use locks::{
    BooleanLatch, CountDownLatch, Lock, Mutex, QueuedMutex, ReentrantLock,
    ReentrantReadWriteLock, Semaphore,
};
pub use thread::{ThreadHandle, ThreadId};

/// A bare mutual-exclusion primitive with no owner tracking.
///
/// # Safety
///
/// Implementations must guarantee that between a successful `lock` or
/// `try_lock` and the matching `unlock`, no other caller can take the lock.
pub unsafe trait RawSimpleLock {
    fn new() -> Self;

    /// Takes the lock if it is free and reports whether it did. Never blocks.
    fn try_lock(&self) -> bool;

    /// Returns once the caller holds the lock.
    fn lock(&self);

    /// Frees a lock the caller holds.
    fn unlock(&self);
}
