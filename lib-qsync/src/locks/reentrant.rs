use std::{fmt, marker::PhantomData, sync::Arc, time::Duration};

use super::Lock;
use crate::{
    error::SyncError,
    synchronizer::{ConditionObject, Policy, QueuedSynchronizer, SyncCore},
    thread::{self, ThreadHandle, ThreadId},
};

#[derive(Debug)]
pub struct ReentrantPolicy {
    fair: bool,
}

pub type Condition = ConditionObject<ReentrantPolicy>;

pub(crate) fn add_holds(current: i64, acquires: i64) -> i64 {
    match current.checked_add(acquires) {
        Some(next) if next > 0 => next,
        _ => panic!("maximum lock count exceeded"),
    }
}

impl ReentrantPolicy {
    fn nonfair_try_acquire(&self, core: &SyncCore, acquires: i64) -> bool {
        let current = thread::current_id();
        let c = core.state();

        if c == 0 {
            if core.compare_and_set_state(0, acquires) {
                core.set_exclusive_owner(Some(current));
                return true;
            }
        } else if core.exclusive_owner() == Some(current) {
            core.set_state(add_holds(c, acquires));
            return true;
        }
        false
    }
}

impl Policy for ReentrantPolicy {
    const EXCLUSIVE: bool = true;

    fn try_acquire(&self, core: &SyncCore, acquires: i64) -> bool {
        if !self.fair {
            return self.nonfair_try_acquire(core, acquires);
        }

        let current = thread::current_id();
        let c = core.state();

        if c == 0 {
            if !core.has_queued_predecessors() && core.compare_and_set_state(0, acquires) {
                core.set_exclusive_owner(Some(current));
                return true;
            }
        } else if core.exclusive_owner() == Some(current) {
            core.set_state(add_holds(c, acquires));
            return true;
        }
        false
    }

    fn try_release(&self, core: &SyncCore, releases: i64) -> Result<bool, SyncError> {
        if !core.is_owned_by_current() {
            return Err(SyncError::IllegalMonitorState);
        }

        let c = core.state() - releases;
        let free = c == 0;
        if free {
            core.set_exclusive_owner(None);
        }
        core.set_state(c);
        Ok(free)
    }

    fn is_held_exclusively(&self, core: &SyncCore) -> bool {
        core.is_owned_by_current()
    }
}

/// A reentrant mutual exclusion lock with optional FIFO fairness and any
/// number of conditions.
pub struct ReentrantLock {
    sync: Arc<QueuedSynchronizer<ReentrantPolicy>>,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReentrantLock {
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    pub fn with_fairness(fair: bool) -> Self {
        Self {
            sync: Arc::new(QueuedSynchronizer::new(0, ReentrantPolicy { fair })),
        }
    }

    pub fn lock(&self) {
        let _ = self.sync.acquire(1);
    }

    pub fn lock_interruptibly(&self) -> Result<(), SyncError> {
        self.sync.acquire_interruptibly(1)
    }

    pub fn try_lock(&self) -> bool {
        self.sync.policy().nonfair_try_acquire(self.sync.core(), 1)
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.sync.try_acquire_for(1, timeout)
    }

    pub fn unlock(&self) -> Result<(), SyncError> {
        self.sync.release(1).map(drop)
    }

    pub fn lock_guard(&self) -> ReentrantLockGuard<'_> {
        self.lock();
        ReentrantLockGuard::new(self)
    }

    pub fn lock_guard_interruptibly(&self) -> Result<ReentrantLockGuard<'_>, SyncError> {
        self.lock_interruptibly()?;
        Ok(ReentrantLockGuard::new(self))
    }

    pub fn new_condition(&self) -> Condition {
        ConditionObject::new(self.sync.clone())
    }

    pub fn hold_count(&self) -> usize {
        if self.sync.is_held_exclusively() {
            self.sync.core().state() as usize
        } else {
            0
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.sync.is_held_exclusively()
    }

    pub fn is_locked(&self) -> bool {
        self.sync.core().state() != 0
    }

    pub fn is_fair(&self) -> bool {
        self.sync.policy().fair
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.sync.core().exclusive_owner()
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.core().has_queued_threads()
    }

    pub fn has_queued_thread(&self, thread: &ThreadHandle) -> bool {
        self.sync.core().is_queued(thread)
    }

    pub fn queue_length(&self) -> usize {
        self.sync.core().queue_length()
    }

    pub fn queued_threads(&self) -> Vec<ThreadHandle> {
        self.sync.core().queued_threads()
    }

    pub fn has_waiters(&self, condition: &Condition) -> Result<bool, SyncError> {
        self.check_owns(condition)?;
        condition.has_waiters()
    }

    pub fn wait_queue_length(&self, condition: &Condition) -> Result<usize, SyncError> {
        self.check_owns(condition)?;
        condition.wait_queue_length()
    }

    pub fn waiting_threads(&self, condition: &Condition) -> Result<Vec<ThreadHandle>, SyncError> {
        self.check_owns(condition)?;
        condition.waiting_threads()
    }

    fn check_owns(&self, condition: &Condition) -> Result<(), SyncError> {
        if !condition.is_owned_by(&self.sync) {
            return Err(SyncError::IllegalArgument("condition does not belong to this lock"));
        }
        Ok(())
    }
}

impl Lock for ReentrantLock {
    type Condition = Condition;

    fn lock(&self) {
        ReentrantLock::lock(self)
    }

    fn lock_interruptibly(&self) -> Result<(), SyncError> {
        ReentrantLock::lock_interruptibly(self)
    }

    fn try_lock(&self) -> bool {
        ReentrantLock::try_lock(self)
    }

    fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        ReentrantLock::try_lock_for(self, timeout)
    }

    fn unlock(&self) -> Result<(), SyncError> {
        ReentrantLock::unlock(self)
    }

    fn new_condition(&self) -> Result<Condition, SyncError> {
        Ok(ReentrantLock::new_condition(self))
    }
}

impl fmt::Display for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner() {
            Some(owner) => write!(f, "[Locked by thread {}]", owner),
            None => write!(f, "[Unlocked]"),
        }
    }
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("fair", &self.is_fair())
            .field("owner", &self.owner())
            .field("queue_length", &self.queue_length())
            .finish()
    }
}

/// Releases one hold on drop. Stays on the thread that locked.
pub struct ReentrantLockGuard<'a> {
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReentrantLockGuard<'a> {
    fn new(lock: &'a ReentrantLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<'a> Drop for ReentrantLockGuard<'a> {
    fn drop(&mut self) {
        let _ = self.lock.unlock();
    }
}
