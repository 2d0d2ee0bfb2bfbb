use std::{fmt, time::Duration};

use crate::{
    error::SyncError,
    synchronizer::{Policy, QueuedSynchronizer, SyncCore},
    thread::ThreadHandle,
};

#[derive(Debug)]
struct BooleanLatchPolicy;

impl Policy for BooleanLatchPolicy {
    const SHARED: bool = true;

    fn try_acquire_shared(&self, core: &SyncCore, _: i64) -> i64 {
        if core.state() != 0 {
            1
        } else {
            -1
        }
    }

    fn try_release_shared(&self, core: &SyncCore, _: i64) -> Result<bool, SyncError> {
        core.set_state(1);
        Ok(true)
    }
}

/// One-shot gate: waiters block until the latch is signalled once.
pub struct BooleanLatch {
    sync: QueuedSynchronizer<BooleanLatchPolicy>,
}

impl Default for BooleanLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl BooleanLatch {
    pub fn new() -> Self {
        Self {
            sync: QueuedSynchronizer::new(0, BooleanLatchPolicy),
        }
    }

    pub fn is_signalled(&self) -> bool {
        self.sync.core().state() != 0
    }

    pub fn signal(&self) {
        let _ = self.sync.release_shared(1);
    }

    pub fn wait(&self) -> Result<(), SyncError> {
        self.sync.acquire_shared_interruptibly(1)
    }

    pub fn wait_uninterruptibly(&self) {
        let _ = self.sync.acquire_shared(1);
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.sync.try_acquire_shared_for(1, timeout)
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.core().has_queued_threads()
    }

    pub fn queued_threads(&self) -> Vec<ThreadHandle> {
        self.sync.core().queued_threads()
    }
}

impl fmt::Debug for BooleanLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BooleanLatch")
            .field("signalled", &self.is_signalled())
            .finish()
    }
}

#[derive(Debug)]
struct CountDownPolicy;

impl Policy for CountDownPolicy {
    const SHARED: bool = true;

    fn try_acquire_shared(&self, core: &SyncCore, _: i64) -> i64 {
        if core.state() == 0 {
            1
        } else {
            -1
        }
    }

    fn try_release_shared(&self, core: &SyncCore, _: i64) -> Result<bool, SyncError> {
        loop {
            let c = core.state();
            if c == 0 {
                return Ok(false);
            }
            let next = c - 1;
            if core.compare_and_set_state(c, next) {
                return Ok(next == 0);
            }
        }
    }
}

/// Lets threads wait until a fixed number of events has happened.
pub struct CountDownLatch {
    sync: QueuedSynchronizer<CountDownPolicy>,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        Self {
            sync: QueuedSynchronizer::new(count, CountDownPolicy),
        }
    }

    pub fn count_down(&self) {
        let _ = self.sync.release_shared(1);
    }

    pub fn count(&self) -> usize {
        self.sync.core().state() as usize
    }

    pub fn wait(&self) -> Result<(), SyncError> {
        self.sync.acquire_shared_interruptibly(1)
    }

    pub fn wait_uninterruptibly(&self) {
        let _ = self.sync.acquire_shared(1);
    }

    /// Returns `true` if the count reached zero in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.sync.try_acquire_shared_for(1, timeout)
    }
}

impl fmt::Display for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Count = {}]", self.count())
    }
}

impl fmt::Debug for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountDownLatch")
            .field("count", &self.count())
            .finish()
    }
}
