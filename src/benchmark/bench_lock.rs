use std::cell::UnsafeCell;

use enum_dispatch::enum_dispatch;
use libqsync::{
    spin_lock::SpinLock, Lock, Mutex, QueuedMutex, ReentrantLock, ReentrantReadWriteLock,
    Semaphore,
};

/// A `u64` counter behind some lock.
#[enum_dispatch]
pub trait CounterLock: Send + Sync {
    /// Runs `f` on the counter while holding the lock.
    fn with_lock(&self, f: &mut dyn FnMut(&mut u64));

    fn value(&self) -> u64 {
        let mut value = 0;
        self.with_lock(&mut |counter: &mut u64| value = *counter);
        value
    }
}

#[enum_dispatch(CounterLock)]
pub enum BenchLock {
    Reentrant(LockCounter<ReentrantLock>),
    Mutex(LockCounter<Mutex>),
    QueuedMutex(QueuedMutex<u64>),
    Semaphore(SemaphoreCounter),
    Write(WriteCounter),
    SpinLock(SpinLock<u64>),
    StdMutex(std::sync::Mutex<u64>),
}

/// Pairs a data-less [`Lock`] with the value it protects.
pub struct LockCounter<L> {
    lock: L,
    value: UnsafeCell<u64>,
}

unsafe impl<L: Lock + Sync> Sync for LockCounter<L> {}

impl<L: Lock> LockCounter<L> {
    pub fn new(lock: L) -> Self {
        Self {
            lock,
            value: UnsafeCell::new(0),
        }
    }
}

impl<L: Lock + Send + Sync> CounterLock for LockCounter<L> {
    fn with_lock(&self, f: &mut dyn FnMut(&mut u64)) {
        self.lock.lock();
        f(unsafe { &mut *self.value.get() });
        let _ = self.lock.unlock();
    }
}

pub struct SemaphoreCounter {
    permits: Semaphore,
    value: UnsafeCell<u64>,
}

unsafe impl Sync for SemaphoreCounter {}

impl SemaphoreCounter {
    pub fn new(permits: Semaphore) -> Self {
        Self {
            permits,
            value: UnsafeCell::new(0),
        }
    }
}

impl CounterLock for SemaphoreCounter {
    fn with_lock(&self, f: &mut dyn FnMut(&mut u64)) {
        self.permits.acquire_uninterruptibly();
        f(unsafe { &mut *self.value.get() });
        let _ = self.permits.release();
    }
}

pub struct WriteCounter {
    rw: ReentrantReadWriteLock,
    value: UnsafeCell<u64>,
}

unsafe impl Sync for WriteCounter {}

impl WriteCounter {
    pub fn new(rw: ReentrantReadWriteLock) -> Self {
        Self {
            rw,
            value: UnsafeCell::new(0),
        }
    }
}

impl CounterLock for WriteCounter {
    fn with_lock(&self, f: &mut dyn FnMut(&mut u64)) {
        let write = self.rw.write_lock();
        write.lock();
        f(unsafe { &mut *self.value.get() });
        let _ = write.unlock();
    }
}

impl CounterLock for QueuedMutex<u64> {
    fn with_lock(&self, f: &mut dyn FnMut(&mut u64)) {
        f(&mut self.lock());
    }
}

impl CounterLock for SpinLock<u64> {
    fn with_lock(&self, f: &mut dyn FnMut(&mut u64)) {
        f(&mut self.lock());
    }
}

impl CounterLock for std::sync::Mutex<u64> {
    fn with_lock(&self, f: &mut dyn FnMut(&mut u64)) {
        // A poisoned counter is still a valid count.
        let mut guard = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
    }
}
