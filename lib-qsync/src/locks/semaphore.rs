use std::{fmt, time::Duration};

use crate::{
    error::SyncError,
    synchronizer::{Policy, QueuedSynchronizer, SyncCore},
    thread::ThreadHandle,
};

#[derive(Debug)]
struct SemaphorePolicy {
    fair: bool,
}

impl SemaphorePolicy {
    fn nonfair_try_acquire_shared(&self, core: &SyncCore, acquires: i64) -> i64 {
        loop {
            let available = core.state();
            let remaining = available - acquires;
            if remaining < 0 || core.compare_and_set_state(available, remaining) {
                return remaining;
            }
        }
    }
}

impl Policy for SemaphorePolicy {
    const SHARED: bool = true;

    fn try_acquire_shared(&self, core: &SyncCore, acquires: i64) -> i64 {
        if !self.fair {
            return self.nonfair_try_acquire_shared(core, acquires);
        }

        loop {
            if core.has_queued_predecessors() {
                return -1;
            }
            let available = core.state();
            let remaining = available - acquires;
            if remaining < 0 || core.compare_and_set_state(available, remaining) {
                return remaining;
            }
        }
    }

    fn try_release_shared(&self, core: &SyncCore, releases: i64) -> Result<bool, SyncError> {
        loop {
            let current = core.state();
            let next = current
                .checked_add(releases)
                .ok_or(SyncError::IllegalArgument("maximum permit count exceeded"))?;
            if core.compare_and_set_state(current, next) {
                return Ok(true);
            }
        }
    }
}

fn permits(count: usize) -> Result<i64, SyncError> {
    i64::try_from(count).map_err(|_| SyncError::IllegalArgument("permit count too large"))
}

/// Counting semaphore. The permit count may go negative through
/// [`Semaphore::new`] or [`Semaphore::reduce_permits`], in which case
/// releases must bring it back up before anyone can acquire.
pub struct Semaphore {
    sync: QueuedSynchronizer<SemaphorePolicy>,
}

impl Semaphore {
    pub fn new(permits: i64) -> Self {
        Self::with_fairness(permits, false)
    }

    pub fn with_fairness(permits: i64, fair: bool) -> Self {
        Self {
            sync: QueuedSynchronizer::new(permits, SemaphorePolicy { fair }),
        }
    }

    pub fn acquire(&self) -> Result<(), SyncError> {
        self.sync.acquire_shared_interruptibly(1)
    }

    pub fn acquire_many(&self, count: usize) -> Result<(), SyncError> {
        self.sync.acquire_shared_interruptibly(permits(count)?)
    }

    pub fn acquire_uninterruptibly(&self) {
        let _ = self.sync.acquire_shared(1);
    }

    pub fn acquire_many_uninterruptibly(&self, count: usize) -> Result<(), SyncError> {
        self.sync.acquire_shared(permits(count)?)
    }

    /// Barges even when fair.
    pub fn try_acquire(&self) -> bool {
        self.sync
            .policy()
            .nonfair_try_acquire_shared(self.sync.core(), 1)
            >= 0
    }

    pub fn try_acquire_many(&self, count: usize) -> Result<bool, SyncError> {
        let count = permits(count)?;
        Ok(self
            .sync
            .policy()
            .nonfair_try_acquire_shared(self.sync.core(), count)
            >= 0)
    }

    pub fn try_acquire_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.sync.try_acquire_shared_for(1, timeout)
    }

    pub fn try_acquire_many_for(&self, count: usize, timeout: Duration) -> Result<bool, SyncError> {
        self.sync.try_acquire_shared_for(permits(count)?, timeout)
    }

    pub fn release(&self) -> Result<(), SyncError> {
        self.sync.release_shared(1).map(drop)
    }

    pub fn release_many(&self, count: usize) -> Result<(), SyncError> {
        self.sync.release_shared(permits(count)?).map(drop)
    }

    pub fn available_permits(&self) -> i64 {
        self.sync.core().state()
    }

    /// Takes every immediately available permit, returning how many.
    pub fn drain_permits(&self) -> i64 {
        let core = self.sync.core();
        loop {
            let current = core.state();
            if current == 0 || core.compare_and_set_state(current, 0) {
                return current;
            }
        }
    }

    pub fn reduce_permits(&self, reduction: i64) -> Result<(), SyncError> {
        if reduction < 0 {
            return Err(SyncError::IllegalArgument("negative reduction"));
        }
        let core = self.sync.core();
        loop {
            let current = core.state();
            let next = current
                .checked_sub(reduction)
                .ok_or(SyncError::IllegalArgument("permit count underflow"))?;
            if core.compare_and_set_state(current, next) {
                return Ok(());
            }
        }
    }

    pub fn is_fair(&self) -> bool {
        self.sync.policy().fair
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.core().has_queued_threads()
    }

    pub fn queue_length(&self) -> usize {
        self.sync.core().queue_length()
    }

    pub fn queued_threads(&self) -> Vec<ThreadHandle> {
        self.sync.core().queued_threads()
    }
}

impl fmt::Display for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Permits = {}]", self.available_permits())
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.available_permits())
            .field("fair", &self.is_fair())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Instant};

    use crate::{
        testing::{await_until, LONG_DELAY, MEDIUM_DELAY, SHORT_DELAY},
        thread::spawn,
    };

    use super::*;

    #[test]
    fn permits_are_counted() {
        let semaphore = Semaphore::new(2);
        assert!(semaphore.try_acquire());
        assert_eq!(semaphore.try_acquire_many(2), Ok(false));
        assert!(semaphore.try_acquire());
        assert!(!semaphore.try_acquire());
        semaphore.release_many(3).unwrap();
        assert_eq!(semaphore.available_permits(), 3);
        assert_eq!(semaphore.to_string(), "[Permits = 3]");
    }

    #[test]
    fn negative_permits_need_releases_first() {
        let semaphore = Semaphore::new(-1);
        assert!(!semaphore.try_acquire());
        semaphore.release().unwrap();
        assert!(!semaphore.try_acquire());
        semaphore.release().unwrap();
        assert!(semaphore.try_acquire());
    }

    #[test]
    fn drain_and_reduce() {
        let semaphore = Semaphore::new(5);
        semaphore.reduce_permits(2).unwrap();
        assert_eq!(semaphore.available_permits(), 3);
        assert_eq!(semaphore.drain_permits(), 3);
        assert_eq!(semaphore.drain_permits(), 0);
        semaphore.reduce_permits(4).unwrap();
        assert_eq!(semaphore.available_permits(), -4);
        assert!(matches!(
            semaphore.reduce_permits(-1),
            Err(SyncError::IllegalArgument(_))
        ));
    }

    #[test]
    fn release_overflow_is_rejected() {
        let semaphore = Semaphore::new(i64::MAX);
        assert!(matches!(
            semaphore.release(),
            Err(SyncError::IllegalArgument(_))
        ));
    }

    #[test]
    fn release_wakes_blocked_acquirers() {
        let semaphore = Arc::new(Semaphore::with_fairness(0, true));
        let waiters = (0..3)
            .map(|_| {
                let semaphore = semaphore.clone();
                spawn(move || semaphore.acquire())
            })
            .collect::<Vec<_>>();

        await_until("three queued acquirers", || semaphore.queue_length() == 3);
        semaphore.release_many(3).unwrap();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(()));
        }
        assert_eq!(semaphore.available_permits(), 0);
    }

    #[test]
    fn back_to_back_releases_wake_both_waiters() {
        for _round in 0..20 {
            let semaphore = Arc::new(Semaphore::new(0));
            let waiters = (0..2)
                .map(|_| {
                    let semaphore = semaphore.clone();
                    spawn(move || {
                        let acquired = semaphore.try_acquire_for(LONG_DELAY);
                        (acquired, Instant::now())
                    })
                })
                .collect::<Vec<_>>();
            await_until("two queued acquirers", || semaphore.queue_length() == 2);

            semaphore.release().unwrap();
            semaphore.release().unwrap();
            let released = Instant::now();

            for waiter in waiters {
                let (acquired, woke) = waiter.join().unwrap();
                assert_eq!(acquired, Ok(true));
                assert!(woke.saturating_duration_since(released) < MEDIUM_DELAY * 5);
            }
            assert_eq!(semaphore.available_permits(), 0);
        }
    }

    #[test]
    fn timed_acquire_of_many_times_out() {
        let semaphore = Arc::new(Semaphore::new(1));
        let other = semaphore.clone();
        let acquired = spawn(move || other.try_acquire_many_for(2, SHORT_DELAY))
            .join()
            .unwrap();
        assert_eq!(acquired, Ok(false));
        assert_eq!(semaphore.available_permits(), 1);
        assert!(!semaphore.has_queued_threads());
    }

    #[test]
    fn interrupted_acquire_fails() {
        let semaphore = Arc::new(Semaphore::new(0));
        let other = semaphore.clone();
        let waiter = spawn(move || other.acquire_many(2));
        await_until("acquirer to queue", || semaphore.has_queued_threads());
        waiter.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(SyncError::Interrupted));
    }
}
