use std::{fmt, sync::Arc, time::Duration};

use super::Lock;
use crate::{
    error::SyncError,
    synchronizer::{ConditionObject, Policy, QueuedSynchronizer, SyncCore},
    thread::{self, ThreadHandle},
};

/// Non-reentrant exclusive ownership: state 0 is free, 1 is held.
#[derive(Debug, Default)]
pub struct MutexPolicy;

impl Policy for MutexPolicy {
    const EXCLUSIVE: bool = true;

    fn try_acquire(&self, core: &SyncCore, acquires: i64) -> bool {
        assert_eq!(acquires, 1);
        if core.compare_and_set_state(0, 1) {
            core.set_exclusive_owner(Some(thread::current_id()));
            return true;
        }
        false
    }

    fn try_release(&self, core: &SyncCore, releases: i64) -> Result<bool, SyncError> {
        assert_eq!(releases, 1);
        if core.state() == 0 {
            return Err(SyncError::IllegalMonitorState);
        }
        core.set_exclusive_owner(None);
        core.set_state(0);
        Ok(true)
    }

    fn is_held_exclusively(&self, core: &SyncCore) -> bool {
        core.state() == 1 && core.is_owned_by_current()
    }
}

/// The simplest client of the queued synchronizer. Unlike
/// [`ReentrantLock`](super::ReentrantLock) any thread may unlock it.
pub struct Mutex {
    sync: Arc<QueuedSynchronizer<MutexPolicy>>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            sync: Arc::new(QueuedSynchronizer::new(0, MutexPolicy)),
        }
    }

    pub fn lock(&self) {
        let _ = self.sync.acquire(1);
    }

    pub fn lock_interruptibly(&self) -> Result<(), SyncError> {
        self.sync.acquire_interruptibly(1)
    }

    pub fn try_lock(&self) -> bool {
        self.sync.policy().try_acquire(self.sync.core(), 1)
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.sync.try_acquire_for(1, timeout)
    }

    pub fn unlock(&self) -> Result<(), SyncError> {
        self.sync.release(1).map(drop)
    }

    pub fn is_locked(&self) -> bool {
        self.sync.core().state() != 0
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.sync.is_held_exclusively()
    }

    pub fn new_condition(&self) -> ConditionObject<MutexPolicy> {
        ConditionObject::new(self.sync.clone())
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.core().has_queued_threads()
    }

    pub fn has_contended(&self) -> bool {
        self.sync.core().has_contended()
    }

    pub fn first_queued_thread(&self) -> Option<ThreadHandle> {
        self.sync.core().first_queued_thread()
    }

    pub fn is_queued(&self, thread: &ThreadHandle) -> bool {
        self.sync.core().is_queued(thread)
    }

    pub fn queue_length(&self) -> usize {
        self.sync.core().queue_length()
    }

    pub fn queued_threads(&self) -> Vec<ThreadHandle> {
        self.sync.core().queued_threads()
    }

    pub fn has_waiters(&self, condition: &ConditionObject<MutexPolicy>) -> Result<bool, SyncError> {
        if !condition.is_owned_by(&self.sync) {
            return Err(SyncError::IllegalArgument("condition does not belong to this mutex"));
        }
        condition.has_waiters()
    }
}

impl Lock for Mutex {
    type Condition = ConditionObject<MutexPolicy>;

    fn lock(&self) {
        Mutex::lock(self)
    }

    fn lock_interruptibly(&self) -> Result<(), SyncError> {
        Mutex::lock_interruptibly(self)
    }

    fn try_lock(&self) -> bool {
        Mutex::try_lock(self)
    }

    fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        Mutex::try_lock_for(self, timeout)
    }

    fn unlock(&self) -> Result<(), SyncError> {
        Mutex::unlock(self)
    }

    fn new_condition(&self) -> Result<Self::Condition, SyncError> {
        Ok(Mutex::new_condition(self))
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("queue_length", &self.queue_length())
            .finish()
    }
}

/// [`lock_api`] adapter so the synchronizer can guard data directly.
pub struct RawQueuedMutex {
    sync: QueuedSynchronizer<MutexPolicy>,
}

unsafe impl lock_api::RawMutex for RawQueuedMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawQueuedMutex {
        sync: QueuedSynchronizer::new(0, MutexPolicy),
    };

    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        let _ = self.sync.acquire(1);
    }

    fn try_lock(&self) -> bool {
        self.sync.policy().try_acquire(self.sync.core(), 1)
    }

    unsafe fn unlock(&self) {
        let _ = self.sync.release(1);
    }

    fn is_locked(&self) -> bool {
        self.sync.core().state() != 0
    }
}

unsafe impl lock_api::RawMutexTimed for RawQueuedMutex {
    type Duration = Duration;
    type Instant = std::time::Instant;

    fn try_lock_for(&self, timeout: Duration) -> bool {
        match self.sync.try_acquire_for(1, timeout) {
            Ok(acquired) => acquired,
            Err(_) => {
                thread::interrupt_current();
                false
            }
        }
    }

    fn try_lock_until(&self, deadline: std::time::Instant) -> bool {
        self.try_lock_for(deadline.saturating_duration_since(std::time::Instant::now()))
    }
}

pub type QueuedMutex<T> = lock_api::Mutex<RawQueuedMutex, T>;
pub type QueuedMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawQueuedMutex, T>;
