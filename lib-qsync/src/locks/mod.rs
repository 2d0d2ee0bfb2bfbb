use std::time::Duration;

use crate::error::SyncError;

mod latch;
mod mutex;
mod reentrant;
mod rwlock;
mod semaphore;

pub use latch::{BooleanLatch, CountDownLatch};
pub use mutex::{Mutex, MutexPolicy, QueuedMutex, QueuedMutexGuard, RawQueuedMutex};
pub use reentrant::{Condition, ReentrantLock, ReentrantLockGuard, ReentrantPolicy};
pub use rwlock::{ReadLock, ReadWritePolicy, ReentrantReadWriteLock, WriteLock};
pub use semaphore::Semaphore;

/// Common surface of the exclusive locks in this module.
pub trait Lock {
    type Condition;

    fn lock(&self);

    fn lock_interruptibly(&self) -> Result<(), SyncError>;

    /// Barging attempt that ignores queued threads even on fair locks.
    fn try_lock(&self) -> bool;

    fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError>;

    fn unlock(&self) -> Result<(), SyncError>;

    fn new_condition(&self) -> Result<Self::Condition, SyncError>;
}
