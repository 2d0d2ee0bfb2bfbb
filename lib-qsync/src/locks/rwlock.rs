use std::{cell::Cell, fmt, sync::Arc, time::Duration};

use thread_local::ThreadLocal;

use super::{reentrant::add_holds, Lock};
use crate::{
    error::SyncError,
    synchronizer::{ConditionObject, Policy, QueuedSynchronizer, SyncCore},
    thread::{self, ThreadHandle, ThreadId},
};

// The state word keeps the read count in the high half and the write hold
// count in the low half.
const SHARED_SHIFT: u32 = 32;
const SHARED_UNIT: i64 = 1 << SHARED_SHIFT;
const MAX_COUNT: i64 = (1 << 31) - 1;
const EXCLUSIVE_MASK: i64 = (1 << SHARED_SHIFT) - 1;

fn shared_count(c: i64) -> i64 {
    c >> SHARED_SHIFT
}

fn exclusive_count(c: i64) -> i64 {
    c & EXCLUSIVE_MASK
}

/// Read holds of one thread. `ThreadLocal` hands the slot of an exited
/// thread to the next new one, so the slot records whose count it is.
struct ReadHolds {
    thread: Cell<u64>,
    count: Cell<usize>,
}

pub struct ReadWritePolicy {
    fair: bool,
    read_holds: ThreadLocal<ReadHolds>,
}

impl ReadWritePolicy {
    fn read_holds(&self) -> &Cell<usize> {
        let current = thread::current_id().as_u64();
        let holds = self.read_holds.get_or(|| ReadHolds {
            thread: Cell::new(current),
            count: Cell::new(0),
        });
        if holds.thread.get() != current {
            holds.thread.set(current);
            holds.count.set(0);
        }
        &holds.count
    }

    fn writer_should_block(&self, core: &SyncCore) -> bool {
        self.fair && core.has_queued_predecessors()
    }

    fn reader_should_block(&self, core: &SyncCore) -> bool {
        if self.fair {
            core.has_queued_predecessors()
        } else {
            // Let a queued writer go first so readers cannot starve it.
            core.apparently_first_queued_is_exclusive()
        }
    }

    fn try_write_lock(&self, core: &SyncCore) -> bool {
        let current = thread::current_id();
        let c = core.state();

        if c != 0 {
            let w = exclusive_count(c);
            if w == 0 || core.exclusive_owner() != Some(current) {
                return false;
            }
            if w == MAX_COUNT {
                panic!("maximum lock count exceeded");
            }
        }
        if !core.compare_and_set_state(c, c + 1) {
            return false;
        }
        core.set_exclusive_owner(Some(current));
        true
    }

    fn try_read_lock(&self, core: &SyncCore) -> bool {
        let current = thread::current_id();
        loop {
            let c = core.state();
            if exclusive_count(c) != 0 && core.exclusive_owner() != Some(current) {
                return false;
            }
            if shared_count(c) == MAX_COUNT {
                panic!("maximum lock count exceeded");
            }
            if core.compare_and_set_state(c, c + SHARED_UNIT) {
                let holds = self.read_holds();
                holds.set(holds.get() + 1);
                return true;
            }
        }
    }
}

impl Policy for ReadWritePolicy {
    const EXCLUSIVE: bool = true;
    const SHARED: bool = true;

    fn try_acquire(&self, core: &SyncCore, acquires: i64) -> bool {
        let current = thread::current_id();
        let c = core.state();
        let w = exclusive_count(c);

        if c != 0 {
            // Readers present, or another writer.
            if w == 0 || core.exclusive_owner() != Some(current) {
                return false;
            }
            if w + acquires > MAX_COUNT {
                panic!("maximum lock count exceeded");
            }
            core.set_state(add_holds(c, acquires));
            return true;
        }

        if self.writer_should_block(core) || !core.compare_and_set_state(c, c + acquires) {
            return false;
        }
        core.set_exclusive_owner(Some(current));
        true
    }

    fn try_release(&self, core: &SyncCore, releases: i64) -> Result<bool, SyncError> {
        if !core.is_owned_by_current() {
            return Err(SyncError::IllegalMonitorState);
        }

        let next = core.state() - releases;
        let free = exclusive_count(next) == 0;
        if free {
            core.set_exclusive_owner(None);
        }
        core.set_state(next);
        Ok(free)
    }

    fn try_acquire_shared(&self, core: &SyncCore, _: i64) -> i64 {
        let current = thread::current_id();
        loop {
            let c = core.state();
            if exclusive_count(c) != 0 {
                if core.exclusive_owner() != Some(current) {
                    return -1;
                }
                // Downgrading: the writer may always take a read hold.
            } else if self.reader_should_block(core) && self.read_holds().get() == 0 {
                return -1;
            }

            if shared_count(c) == MAX_COUNT {
                panic!("maximum lock count exceeded");
            }
            if core.compare_and_set_state(c, c + SHARED_UNIT) {
                let holds = self.read_holds();
                holds.set(holds.get() + 1);
                return 1;
            }
        }
    }

    fn try_release_shared(&self, core: &SyncCore, _: i64) -> Result<bool, SyncError> {
        let holds = self.read_holds();
        if holds.get() == 0 {
            return Err(SyncError::IllegalMonitorState);
        }
        holds.set(holds.get() - 1);

        loop {
            let c = core.state();
            let next = c - SHARED_UNIT;
            if core.compare_and_set_state(c, next) {
                return Ok(next == 0);
            }
        }
    }

    fn is_held_exclusively(&self, core: &SyncCore) -> bool {
        core.is_owned_by_current()
    }
}

impl fmt::Debug for ReadWritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadWritePolicy")
            .field("fair", &self.fair)
            .finish()
    }
}

/// A pair of locks: any number of readers or one writer. Both sides are
/// reentrant, a writer may also take the read lock (downgrading), but a
/// reader can never upgrade.
pub struct ReentrantReadWriteLock {
    sync: Arc<QueuedSynchronizer<ReadWritePolicy>>,
}

impl Default for ReentrantReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReentrantReadWriteLock {
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    pub fn with_fairness(fair: bool) -> Self {
        Self {
            sync: Arc::new(QueuedSynchronizer::new(
                0,
                ReadWritePolicy {
                    fair,
                    read_holds: ThreadLocal::new(),
                },
            )),
        }
    }

    pub fn read_lock(&self) -> ReadLock<'_> {
        ReadLock { sync: &self.sync }
    }

    pub fn write_lock(&self) -> WriteLock<'_> {
        WriteLock { sync: &self.sync }
    }

    pub fn is_fair(&self) -> bool {
        self.sync.policy().fair
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.sync.core().exclusive_owner()
    }

    pub fn read_lock_count(&self) -> usize {
        shared_count(self.sync.core().state()) as usize
    }

    /// Read holds of the calling thread.
    pub fn read_hold_count(&self) -> usize {
        self.sync.policy().read_holds().get()
    }

    pub fn is_write_locked(&self) -> bool {
        exclusive_count(self.sync.core().state()) != 0
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.sync.is_held_exclusively()
    }

    pub fn write_hold_count(&self) -> usize {
        if self.sync.is_held_exclusively() {
            exclusive_count(self.sync.core().state()) as usize
        } else {
            0
        }
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

    pub fn queued_writer_threads(&self) -> Vec<ThreadHandle> {
        self.sync.core().exclusive_queued_threads()
    }

    pub fn queued_reader_threads(&self) -> Vec<ThreadHandle> {
        self.sync.core().shared_queued_threads()
    }

    pub fn has_waiters(&self, condition: &ConditionObject<ReadWritePolicy>) -> Result<bool, SyncError> {
        self.check_owns(condition)?;
        condition.has_waiters()
    }

    pub fn wait_queue_length(
        &self,
        condition: &ConditionObject<ReadWritePolicy>,
    ) -> Result<usize, SyncError> {
        self.check_owns(condition)?;
        condition.wait_queue_length()
    }

    fn check_owns(&self, condition: &ConditionObject<ReadWritePolicy>) -> Result<(), SyncError> {
        if !condition.is_owned_by(&self.sync) {
            return Err(SyncError::IllegalArgument("condition does not belong to this lock"));
        }
        Ok(())
    }
}

impl fmt::Display for ReentrantReadWriteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.sync.core().state();
        write!(
            f,
            "[Write locks = {}, Read locks = {}]",
            exclusive_count(c),
            shared_count(c)
        )
    }
}

impl fmt::Debug for ReentrantReadWriteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantReadWriteLock")
            .field("fair", &self.is_fair())
            .field("state", &self.to_string())
            .finish()
    }
}

#[derive(Clone, Copy)]
pub struct ReadLock<'a> {
    sync: &'a Arc<QueuedSynchronizer<ReadWritePolicy>>,
}

impl<'a> ReadLock<'a> {
    pub fn lock(&self) {
        let _ = self.sync.acquire_shared(1);
    }

    pub fn lock_interruptibly(&self) -> Result<(), SyncError> {
        self.sync.acquire_shared_interruptibly(1)
    }

    pub fn try_lock(&self) -> bool {
        self.sync.policy().try_read_lock(self.sync.core())
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.sync.try_acquire_shared_for(1, timeout)
    }

    pub fn unlock(&self) -> Result<(), SyncError> {
        self.sync.release_shared(1).map(drop)
    }
}

impl<'a> Lock for ReadLock<'a> {
    type Condition = ConditionObject<ReadWritePolicy>;

    fn lock(&self) {
        ReadLock::lock(self)
    }

    fn lock_interruptibly(&self) -> Result<(), SyncError> {
        ReadLock::lock_interruptibly(self)
    }

    fn try_lock(&self) -> bool {
        ReadLock::try_lock(self)
    }

    fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        ReadLock::try_lock_for(self, timeout)
    }

    fn unlock(&self) -> Result<(), SyncError> {
        ReadLock::unlock(self)
    }

    fn new_condition(&self) -> Result<Self::Condition, SyncError> {
        Err(SyncError::Unsupported("read locks have no conditions"))
    }
}

impl<'a> fmt::Display for ReadLock<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Read locks = {}]", shared_count(self.sync.core().state()))
    }
}

#[derive(Clone, Copy)]
pub struct WriteLock<'a> {
    sync: &'a Arc<QueuedSynchronizer<ReadWritePolicy>>,
}

impl<'a> WriteLock<'a> {
    pub fn lock(&self) {
        let _ = self.sync.acquire(1);
    }

    pub fn lock_interruptibly(&self) -> Result<(), SyncError> {
        self.sync.acquire_interruptibly(1)
    }

    pub fn try_lock(&self) -> bool {
        self.sync.policy().try_write_lock(self.sync.core())
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.sync.try_acquire_for(1, timeout)
    }

    pub fn unlock(&self) -> Result<(), SyncError> {
        self.sync.release(1).map(drop)
    }

    pub fn new_condition(&self) -> ConditionObject<ReadWritePolicy> {
        ConditionObject::new(self.sync.clone())
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.sync.is_held_exclusively()
    }

    pub fn hold_count(&self) -> usize {
        if self.sync.is_held_exclusively() {
            exclusive_count(self.sync.core().state()) as usize
        } else {
            0
        }
    }
}

impl<'a> Lock for WriteLock<'a> {
    type Condition = ConditionObject<ReadWritePolicy>;

    fn lock(&self) {
        WriteLock::lock(self)
    }

    fn lock_interruptibly(&self) -> Result<(), SyncError> {
        WriteLock::lock_interruptibly(self)
    }

    fn try_lock(&self) -> bool {
        WriteLock::try_lock(self)
    }

    fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        WriteLock::try_lock_for(self, timeout)
    }

    fn unlock(&self) -> Result<(), SyncError> {
        WriteLock::unlock(self)
    }

    fn new_condition(&self) -> Result<Self::Condition, SyncError> {
        Ok(WriteLock::new_condition(self))
    }
}

impl<'a> fmt::Display for WriteLock<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sync.core().exclusive_owner() {
            Some(owner) => write!(f, "[Locked by thread {}]", owner),
            None => write!(f, "[Unlocked]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        testing::{await_until, SHORT_DELAY},
        thread::spawn,
    };

    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let rw = Arc::new(ReentrantReadWriteLock::new());
        rw.read_lock().lock();
        rw.read_lock().lock();
        assert_eq!(rw.read_lock_count(), 2);
        assert_eq!(rw.read_hold_count(), 2);

        let other = rw.clone();
        let (read, write) = spawn(move || {
            let read = other.read_lock().try_lock();
            if read {
                other.read_lock().unlock().unwrap();
            }
            (read, other.write_lock().try_lock())
        })
        .join()
        .unwrap();
        assert!(read);
        assert!(!write);

        rw.read_lock().unlock().unwrap();
        rw.read_lock().unlock().unwrap();
        assert_eq!(rw.read_lock().unlock(), Err(SyncError::IllegalMonitorState));
        assert_eq!(rw.to_string(), "[Write locks = 0, Read locks = 0]");
    }

    #[test]
    fn writer_is_reentrant_and_may_downgrade() {
        let rw = ReentrantReadWriteLock::new();
        let write = rw.write_lock();
        write.lock();
        write.lock();
        assert_eq!(write.hold_count(), 2);
        assert_eq!(rw.owner(), Some(thread::current_id()));

        rw.read_lock().lock();
        write.unlock().unwrap();
        write.unlock().unwrap();
        assert!(!rw.is_write_locked());
        assert_eq!(rw.read_lock_count(), 1);
        rw.read_lock().unlock().unwrap();
    }

    #[test]
    fn reader_cannot_upgrade() {
        let rw = ReentrantReadWriteLock::new();
        rw.read_lock().lock();
        assert!(!rw.write_lock().try_lock());
        assert_eq!(rw.write_lock().try_lock_for(SHORT_DELAY), Ok(false));
        rw.read_lock().unlock().unwrap();
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let rw = Arc::new(ReentrantReadWriteLock::new());
        rw.read_lock().lock();

        let other = rw.clone();
        let writer = spawn(move || {
            other.write_lock().lock();
            other.write_lock().unlock().unwrap();
        });
        await_until("writer to queue", || rw.has_queued_thread(writer.thread()));
        assert_eq!(rw.queued_writer_threads(), vec![writer.thread().clone()]);

        let other = rw.clone();
        let reader = spawn(move || {
            other.read_lock().lock();
            other.read_lock().unlock().unwrap();
        });
        await_until("reader to queue", || rw.has_queued_thread(reader.thread()));
        assert_eq!(rw.queued_reader_threads(), vec![reader.thread().clone()]);

        rw.read_lock().unlock().unwrap();
        writer.join().unwrap();
        reader.join().unwrap();
        assert!(!rw.has_queued_threads());
    }

    #[test]
    fn write_lock_condition() {
        let rw = Arc::new(ReentrantReadWriteLock::with_fairness(true));
        let cond = Arc::new(rw.write_lock().new_condition());
        assert!(matches!(
            Lock::new_condition(&rw.read_lock()),
            Err(SyncError::Unsupported(_))
        ));

        let (rw2, cond2) = (rw.clone(), cond.clone());
        let waiter = spawn(move || {
            rw2.write_lock().lock();
            let result = cond2.wait();
            rw2.write_lock().unlock().unwrap();
            result
        });

        await_until("waiter on condition", || {
            rw.write_lock().lock();
            let waiting = rw.wait_queue_length(&cond) == Ok(1);
            rw.write_lock().unlock().unwrap();
            waiting
        });

        rw.write_lock().lock();
        assert_eq!(rw.has_waiters(&cond), Ok(true));
        cond.signal().unwrap();
        rw.write_lock().unlock().unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn exited_reader_holds_do_not_pass_to_new_threads() {
        let rw = Arc::new(ReentrantReadWriteLock::new());

        let other = rw.clone();
        std::thread::spawn(move || other.read_lock().lock())
            .join()
            .unwrap();
        assert_eq!(rw.read_lock_count(), 1);

        for _ in 0..4 {
            let other = rw.clone();
            let (holds, unlock) = std::thread::spawn(move || {
                (other.read_hold_count(), other.read_lock().unlock())
            })
            .join()
            .unwrap();
            assert_eq!(holds, 0);
            assert_eq!(unlock, Err(SyncError::IllegalMonitorState));
        }
        assert_eq!(rw.read_lock_count(), 1);
    }

    #[test]
    fn interrupted_read_lock_fails() {
        let rw = Arc::new(ReentrantReadWriteLock::new());
        rw.write_lock().lock();

        let other = rw.clone();
        let reader = spawn(move || other.read_lock().lock_interruptibly());
        await_until("reader to queue", || rw.has_queued_thread(reader.thread()));
        reader.interrupt();

        assert_eq!(reader.join().unwrap(), Err(SyncError::Interrupted));
        rw.write_lock().unlock().unwrap();
    }
}
