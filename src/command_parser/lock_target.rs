use clap::ValueEnum;
use libqsync::{
    spin_lock::SpinLock, Mutex, QueuedMutex, ReentrantLock, ReentrantReadWriteLock, Semaphore,
};
use serde::Serialize;
use strum::{Display, EnumIter};

use crate::benchmark::bench_lock::{BenchLock, LockCounter, SemaphoreCounter, WriteCounter};

#[derive(Debug, ValueEnum, EnumIter, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum LockTarget {
    /// Barging reentrant lock
    ReentrantLock,
    /// Reentrant lock granting in arrival order
    FairReentrantLock,
    /// Non-reentrant mutex
    Mutex,
    /// Mutex guarding its data through lock_api
    QueuedMutex,
    /// Single-permit semaphore
    Semaphore,
    /// Write side of the read-write lock
    WriteLock,
    /// Test-and-test-and-set spin lock
    SpinLock,
    /// std::sync::Mutex as a baseline
    StdMutex,
}

impl LockTarget {
    pub fn to_locktype(&self) -> BenchLock {
        match self {
            LockTarget::ReentrantLock => LockCounter::new(ReentrantLock::new()).into(),
            LockTarget::FairReentrantLock => {
                LockCounter::new(ReentrantLock::with_fairness(true)).into()
            }
            LockTarget::Mutex => LockCounter::new(Mutex::new()).into(),
            LockTarget::QueuedMutex => QueuedMutex::new(0u64).into(),
            LockTarget::Semaphore => SemaphoreCounter::new(Semaphore::new(1)).into(),
            LockTarget::WriteLock => WriteCounter::new(ReentrantReadWriteLock::new()).into(),
            LockTarget::SpinLock => SpinLock::new(0u64).into(),
            LockTarget::StdMutex => std::sync::Mutex::new(0u64).into(),
        }
    }
}
