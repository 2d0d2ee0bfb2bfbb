//! The queued synchronizer: an atomic state word plus a FIFO queue of blocked
//! threads. Concrete synchronizers supply a [`Policy`] that says what the
//! state means; blocking, queueing, timeouts and interruption live here.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering::*},
        Arc,
    },
    time::Duration,
};

use crossbeam::utils::CachePadded;

use crate::{
    deadline::Deadline,
    error::SyncError,
    spin_lock::SpinLock,
    thread::{self, ThreadHandle, ThreadId},
};

pub mod condition;
mod node;

pub use condition::ConditionObject;
pub use node::Mode;
pub(crate) use node::WaitNode;

/// State, owner and wait queue shared by every synchronizer.
pub struct SyncCore {
    state: CachePadded<AtomicI64>,
    owner: AtomicU64,
    contended: AtomicBool,
    queue: SpinLock<VecDeque<Arc<WaitNode>>>,
}

impl SyncCore {
    pub const fn new(initial: i64) -> Self {
        Self {
            state: CachePadded::new(AtomicI64::new(initial)),
            owner: AtomicU64::new(0),
            contended: AtomicBool::new(false),
            queue: SpinLock::new(VecDeque::new()),
        }
    }

    pub fn state(&self) -> i64 {
        self.state.load(Acquire)
    }

    pub fn set_state(&self, state: i64) {
        self.state.store(state, Release);
    }

    pub fn compare_and_set_state(&self, expect: i64, update: i64) -> bool {
        self.state
            .compare_exchange(expect, update, AcqRel, Acquire)
            .is_ok()
    }

    pub fn exclusive_owner(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.owner.load(Acquire))
    }

    pub fn set_exclusive_owner(&self, owner: Option<ThreadId>) {
        self.owner
            .store(owner.map_or(0, |id| id.as_u64()), Release);
    }

    pub fn is_owned_by_current(&self) -> bool {
        self.owner.load(Acquire) == thread::current_id().as_u64()
    }

    pub fn has_queued_threads(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Whether any thread has ever had to block here.
    pub fn has_contended(&self) -> bool {
        self.contended.load(Acquire)
    }

    pub fn first_queued_thread(&self) -> Option<ThreadHandle> {
        self.queue.lock().front().map(|node| node.thread.clone())
    }

    pub fn is_queued(&self, thread: &ThreadHandle) -> bool {
        self.queue.lock().iter().any(|node| node.thread == *thread)
    }

    pub fn queue_length(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn queued_threads(&self) -> Vec<ThreadHandle> {
        self.queued_threads_where(|_| true)
    }

    pub fn exclusive_queued_threads(&self) -> Vec<ThreadHandle> {
        self.queued_threads_where(|mode| mode == Mode::Exclusive)
    }

    pub fn shared_queued_threads(&self) -> Vec<ThreadHandle> {
        self.queued_threads_where(|mode| mode == Mode::Shared)
    }

    fn queued_threads_where(&self, pred: impl Fn(Mode) -> bool) -> Vec<ThreadHandle> {
        self.queue
            .lock()
            .iter()
            .filter(|node| pred(node.mode))
            .map(|node| node.thread.clone())
            .collect()
    }

    /// True when some other thread is queued ahead of the caller. Fair
    /// policies refuse to barge while this holds.
    pub fn has_queued_predecessors(&self) -> bool {
        let current = thread::current_id();
        match self.queue.lock().front() {
            Some(node) => node.thread.id() != current,
            None => false,
        }
    }

    pub fn apparently_first_queued_is_exclusive(&self) -> bool {
        matches!(self.queue.lock().front(), Some(node) if node.mode == Mode::Exclusive)
    }

    pub(crate) fn enqueue(&self, node: Arc<WaitNode>) {
        self.contended.store(true, Release);
        let mut queue = self.queue.lock();
        queue.push_back(node.clone());
        node.mark_queued();
    }

    fn is_first(&self, node: &Arc<WaitNode>) -> bool {
        matches!(self.queue.lock().front(), Some(first) if Arc::ptr_eq(first, node))
    }

    /// Unlinks `node`, returning whether it was at the head.
    fn remove(&self, node: &Arc<WaitNode>) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|queued| Arc::ptr_eq(queued, node)) {
            Some(index) => {
                queue.remove(index);
                index == 0
            }
            None => false,
        }
    }

    pub(crate) fn wake_first(&self) {
        let first = self.queue.lock().front().map(|node| node.thread.clone());
        if let Some(thread) = first {
            thread.unpark();
        }
    }
}

impl fmt::Debug for SyncCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCore")
            .field("state", &self.state())
            .field("owner", &self.exclusive_owner())
            .field("queue_length", &self.queue_length())
            .finish()
    }
}

/// What the state word means. Exclusive operations are for locks, shared
/// ones for latches and permits; a policy implements only the family it
/// supports and sets the matching flag.
pub trait Policy: Send + Sync {
    const EXCLUSIVE: bool = false;
    const SHARED: bool = false;

    fn try_acquire(&self, core: &SyncCore, arg: i64) -> bool {
        let _ = (core, arg);
        false
    }

    fn try_release(&self, core: &SyncCore, arg: i64) -> Result<bool, SyncError> {
        let _ = (core, arg);
        Err(SyncError::Unsupported("exclusive release"))
    }

    /// Negative on failure, zero when no further shared acquire can
    /// succeed, positive when later shared acquirers may succeed too.
    fn try_acquire_shared(&self, core: &SyncCore, arg: i64) -> i64 {
        let _ = (core, arg);
        -1
    }

    fn try_release_shared(&self, core: &SyncCore, arg: i64) -> Result<bool, SyncError> {
        let _ = (core, arg);
        Err(SyncError::Unsupported("shared release"))
    }

    fn is_held_exclusively(&self, core: &SyncCore) -> bool {
        let _ = core;
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acquired { interrupted: bool },
    TimedOut,
    Interrupted,
}

pub struct QueuedSynchronizer<P: Policy> {
    core: SyncCore,
    policy: P,
}

impl<P: Policy> QueuedSynchronizer<P> {
    pub const fn new(initial: i64, policy: P) -> Self {
        Self {
            core: SyncCore::new(initial),
            policy,
        }
    }

    pub fn core(&self) -> &SyncCore {
        &self.core
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn is_held_exclusively(&self) -> bool {
        self.policy.is_held_exclusively(&self.core)
    }

    /// Acquires in exclusive mode, ignoring interrupts. An interrupt that
    /// arrives while blocked is re-asserted once the acquire succeeds.
    pub fn acquire(&self, arg: i64) -> Result<(), SyncError> {
        self.acquire_uninterruptibly(Mode::Exclusive, arg)
    }

    pub fn acquire_interruptibly(&self, arg: i64) -> Result<(), SyncError> {
        self.acquire_interruptibly_in(Mode::Exclusive, arg)
    }

    /// Tries to acquire before `timeout` elapses. A zero timeout makes a
    /// single attempt without queueing.
    pub fn try_acquire_for(&self, arg: i64, timeout: Duration) -> Result<bool, SyncError> {
        self.try_acquire_for_in(Mode::Exclusive, arg, timeout)
    }

    pub fn release(&self, arg: i64) -> Result<bool, SyncError> {
        if self.policy.try_release(&self.core, arg)? {
            self.core.wake_first();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn acquire_shared(&self, arg: i64) -> Result<(), SyncError> {
        self.acquire_uninterruptibly(Mode::Shared, arg)
    }

    pub fn acquire_shared_interruptibly(&self, arg: i64) -> Result<(), SyncError> {
        self.acquire_interruptibly_in(Mode::Shared, arg)
    }

    pub fn try_acquire_shared_for(&self, arg: i64, timeout: Duration) -> Result<bool, SyncError> {
        self.try_acquire_for_in(Mode::Shared, arg, timeout)
    }

    pub fn release_shared(&self, arg: i64) -> Result<bool, SyncError> {
        if self.policy.try_release_shared(&self.core, arg)? {
            self.core.wake_first();
            return Ok(true);
        }
        Ok(false)
    }

    fn check_supported(&self, mode: Mode) -> Result<(), SyncError> {
        match mode {
            Mode::Exclusive if !P::EXCLUSIVE => Err(SyncError::Unsupported("exclusive acquire")),
            Mode::Shared if !P::SHARED => Err(SyncError::Unsupported("shared acquire")),
            _ => Ok(()),
        }
    }

    /// `Some(propagate)` on success.
    fn try_acquire_in(&self, mode: Mode, arg: i64) -> Option<bool> {
        match mode {
            Mode::Exclusive => self.policy.try_acquire(&self.core, arg).then_some(false),
            Mode::Shared => {
                let remaining = self.policy.try_acquire_shared(&self.core, arg);
                (remaining >= 0).then_some(remaining > 0)
            }
        }
    }

    fn acquire_uninterruptibly(&self, mode: Mode, arg: i64) -> Result<(), SyncError> {
        self.check_supported(mode)?;
        if self.try_acquire_in(mode, arg).is_some() {
            return Ok(());
        }

        let node = self.enqueue_current(mode);
        if let Outcome::Acquired { interrupted: true } =
            self.acquire_queued(&node, arg, false, Deadline::never())
        {
            thread::interrupt_current();
        }
        Ok(())
    }

    fn acquire_interruptibly_in(&self, mode: Mode, arg: i64) -> Result<(), SyncError> {
        self.check_supported(mode)?;
        if thread::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.try_acquire_in(mode, arg).is_some() {
            return Ok(());
        }

        let node = self.enqueue_current(mode);
        match self.acquire_queued(&node, arg, true, Deadline::never()) {
            Outcome::Acquired { .. } => Ok(()),
            Outcome::Interrupted => Err(SyncError::Interrupted),
            Outcome::TimedOut => Err(SyncError::Timeout),
        }
    }

    fn try_acquire_for_in(&self, mode: Mode, arg: i64, timeout: Duration) -> Result<bool, SyncError> {
        self.check_supported(mode)?;
        if thread::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.try_acquire_in(mode, arg).is_some() {
            return Ok(true);
        }
        if timeout.is_zero() {
            return Ok(false);
        }

        let node = self.enqueue_current(mode);
        match self.acquire_queued(&node, arg, true, Deadline::after(timeout)) {
            Outcome::Acquired { .. } => Ok(true),
            Outcome::TimedOut => Ok(false),
            Outcome::Interrupted => Err(SyncError::Interrupted),
        }
    }

    fn enqueue_current(&self, mode: Mode) -> Arc<WaitNode> {
        let node = Arc::new(WaitNode::new(ThreadHandle::current(), mode));
        self.core.enqueue(node.clone());
        node
    }

    /// Blocks the owner of the already queued `node` until it reaches the
    /// head of the queue and the policy lets it through.
    pub(crate) fn acquire_queued(
        &self,
        node: &Arc<WaitNode>,
        arg: i64,
        interruptible: bool,
        deadline: Deadline,
    ) -> Outcome {
        let mut interrupted = false;

        loop {
            if self.core.is_first(node) {
                if let Some(propagate) = self.try_acquire_in(node.mode, arg) {
                    self.core.remove(node);
                    // A shared release landing between the acquire and the
                    // unlink above unparked this node, not its successor.
                    if propagate || node.mode == Mode::Shared {
                        self.core.wake_first();
                    }
                    return Outcome::Acquired { interrupted };
                }
            }

            match deadline.remaining() {
                Some(left) if left.is_zero() => {
                    self.cancel(node);
                    return Outcome::TimedOut;
                }
                Some(left) => thread::park_timeout(left),
                None => thread::park(),
            }

            if thread::interrupted() {
                if interruptible {
                    self.cancel(node);
                    return Outcome::Interrupted;
                }
                interrupted = true;
            }
        }
    }

    fn cancel(&self, node: &Arc<WaitNode>) {
        node.set_status(node::CANCELLED);
        if self.core.remove(node) {
            self.core.wake_first();
        }
    }
}

impl<P: Policy + fmt::Debug> fmt::Debug for QueuedSynchronizer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedSynchronizer")
            .field("core", &self.core)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        testing::{await_queued, SHORT_DELAY},
        thread::{self, spawn, ThreadHandle},
    };

    use super::*;

    /// Non-reentrant exclusive lock: state 0 is free, 1 is held.
    #[derive(Debug)]
    struct Exclusive;

    impl Policy for Exclusive {
        const EXCLUSIVE: bool = true;

        fn try_acquire(&self, core: &SyncCore, _: i64) -> bool {
            if core.compare_and_set_state(0, 1) {
                core.set_exclusive_owner(Some(thread::current_id()));
                return true;
            }
            false
        }

        fn try_release(&self, core: &SyncCore, _: i64) -> Result<bool, SyncError> {
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

    /// Gate that opens once released.
    #[derive(Debug)]
    struct Gate;

    impl Policy for Gate {
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

    #[test]
    fn exclusive_acquire_and_release() {
        let sync = QueuedSynchronizer::new(0, Exclusive);
        sync.acquire(1).unwrap();
        assert!(sync.is_held_exclusively());
        assert_eq!(sync.core().exclusive_owner(), Some(thread::current_id()));
        assert_eq!(sync.release(1), Ok(true));
        assert!(!sync.is_held_exclusively());
        assert_eq!(sync.release(1), Err(SyncError::IllegalMonitorState));
    }

    #[test]
    fn unsupported_release_is_reported() {
        let sync = QueuedSynchronizer::new(0, Gate);
        assert_eq!(sync.release(1), Err(SyncError::Unsupported("exclusive release")));
    }

    #[test]
    fn unsupported_acquire_is_reported() {
        let gate = QueuedSynchronizer::new(1, Gate);
        assert_eq!(gate.acquire(1), Err(SyncError::Unsupported("exclusive acquire")));
        assert_eq!(
            gate.try_acquire_for(1, SHORT_DELAY),
            Err(SyncError::Unsupported("exclusive acquire"))
        );

        let lock = QueuedSynchronizer::new(0, Exclusive);
        assert_eq!(
            lock.acquire_shared_interruptibly(1),
            Err(SyncError::Unsupported("shared acquire"))
        );
        assert_eq!(lock.core().state(), 0);
        assert!(!lock.core().has_contended());
    }

    #[test]
    fn zero_timeout_does_not_queue() {
        let sync = QueuedSynchronizer::new(0, Exclusive);
        sync.acquire(1).unwrap();

        let sync = Arc::new(sync);
        let other = sync.clone();
        let acquired = spawn(move || other.try_acquire_for(1, Duration::ZERO))
            .join()
            .unwrap();

        assert_eq!(acquired, Ok(false));
        assert!(!sync.core().has_contended());
    }

    #[test]
    fn queued_threads_are_visible_in_order() {
        let sync = Arc::new(QueuedSynchronizer::new(0, Exclusive));
        sync.acquire(1).unwrap();

        let first = {
            let sync = sync.clone();
            spawn(move || {
                sync.acquire(1).unwrap();
                sync.release(1).unwrap();
            })
        };
        await_queued(sync.core(), first.thread());

        let second = {
            let sync = sync.clone();
            spawn(move || {
                sync.acquire_interruptibly(1).unwrap();
                sync.release(1).unwrap();
            })
        };
        await_queued(sync.core(), second.thread());

        assert_eq!(sync.core().queue_length(), 2);
        assert_eq!(sync.core().first_queued_thread().as_ref(), Some(first.thread()));
        assert_eq!(
            sync.core().queued_threads(),
            vec![first.thread().clone(), second.thread().clone()]
        );
        assert!(sync.core().has_contended());

        sync.release(1).unwrap();
        first.join().unwrap();
        second.join().unwrap();
        assert!(!sync.core().has_queued_threads());
    }

    #[test]
    fn interrupt_cancels_interruptible_acquire() {
        let sync = Arc::new(QueuedSynchronizer::new(0, Exclusive));
        sync.acquire(1).unwrap();

        let waiter = {
            let sync = sync.clone();
            spawn(move || sync.acquire_interruptibly(1))
        };
        await_queued(sync.core(), waiter.thread());
        waiter.interrupt();

        assert_eq!(waiter.join().unwrap(), Err(SyncError::Interrupted));
        assert!(!sync.core().has_queued_threads());
        sync.release(1).unwrap();
    }

    #[test]
    fn uninterruptible_acquire_reasserts_interrupt() {
        let sync = Arc::new(QueuedSynchronizer::new(0, Exclusive));
        sync.acquire(1).unwrap();

        let waiter = {
            let sync = sync.clone();
            spawn(move || {
                sync.acquire(1).unwrap();
                let interrupted = thread::interrupted();
                sync.release(1).unwrap();
                interrupted
            })
        };
        await_queued(sync.core(), waiter.thread());
        waiter.interrupt();
        std::thread::sleep(SHORT_DELAY);
        assert!(sync.core().is_queued(waiter.thread()));

        sync.release(1).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn timed_acquire_gives_up() {
        let sync = Arc::new(QueuedSynchronizer::new(0, Exclusive));
        sync.acquire(1).unwrap();

        let other = sync.clone();
        let acquired = spawn(move || other.try_acquire_for(1, SHORT_DELAY))
            .join()
            .unwrap();

        assert_eq!(acquired, Ok(false));
        assert!(!sync.core().has_queued_threads());
    }

    #[test]
    fn shared_release_wakes_every_waiter() {
        let gate = Arc::new(QueuedSynchronizer::new(0, Gate));
        let waiters = (0..3)
            .map(|_| {
                let gate = gate.clone();
                spawn(move || gate.acquire_shared_interruptibly(1))
            })
            .collect::<Vec<_>>();

        for waiter in &waiters {
            await_queued(gate.core(), waiter.thread());
        }
        assert_eq!(gate.core().shared_queued_threads().len(), 3);
        assert!(gate.core().exclusive_queued_threads().is_empty());

        gate.release_shared(1).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(()));
        }
    }

    #[test]
    fn pending_interrupt_fails_fast() {
        let gate = QueuedSynchronizer::new(0, Gate);
        ThreadHandle::current().interrupt();
        assert_eq!(
            gate.try_acquire_shared_for(1, Duration::from_secs(10)),
            Err(SyncError::Interrupted)
        );
        assert!(!thread::is_interrupted());
    }
}
