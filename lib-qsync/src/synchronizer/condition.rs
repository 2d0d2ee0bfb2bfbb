use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use crossbeam::utils::Backoff;

use super::{
    node::{CANCELLED, CONDITION, WAITING},
    Outcome, Policy, QueuedSynchronizer, WaitNode,
};
use crate::{
    deadline::Deadline,
    error::SyncError,
    spin_lock::SpinLock,
    thread::{self, ThreadHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptMode {
    None,
    Reinterrupt,
    Fail,
}

/// A wait set bound to the exclusive synchronizer it was created from.
///
/// Waiting fully releases the synchronizer, and a signalled waiter moves to
/// the synchronizer's queue, where it competes to reacquire with the saved
/// hold count before returning.
pub struct ConditionObject<P: Policy> {
    sync: Arc<QueuedSynchronizer<P>>,
    waiters: SpinLock<VecDeque<Arc<WaitNode>>>,
}

impl<P: Policy> ConditionObject<P> {
    pub fn new(sync: Arc<QueuedSynchronizer<P>>) -> Self {
        Self {
            sync,
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    pub fn is_owned_by(&self, sync: &Arc<QueuedSynchronizer<P>>) -> bool {
        Arc::ptr_eq(&self.sync, sync)
    }

    /// Waits until signalled or interrupted.
    pub fn wait(&self) -> Result<(), SyncError> {
        self.wait_inner(true, Deadline::never()).map(drop)
    }

    pub fn wait_uninterruptibly(&self) -> Result<(), SyncError> {
        self.wait_inner(false, Deadline::never()).map(drop)
    }

    /// Waits at most `timeout`, returning an estimate of the time left.
    /// A zero result means the wait timed out.
    pub fn wait_for(&self, timeout: Duration) -> Result<Duration, SyncError> {
        let deadline = Deadline::after(timeout);
        if !self.wait_inner(true, deadline)? {
            return Ok(Duration::ZERO);
        }
        Ok(deadline.remaining().unwrap_or(Duration::MAX))
    }

    /// Returns `false` if the wait timed out.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.wait_inner(true, Deadline::after(timeout))
    }

    pub fn wait_until(&self, deadline: SystemTime) -> Result<bool, SyncError> {
        self.wait_inner(true, Deadline::at_system_time(deadline))
    }

    /// Moves the longest waiting thread to the lock's queue.
    pub fn signal(&self) -> Result<(), SyncError> {
        self.check_held()?;

        loop {
            let next = self.waiters.lock().pop_front();
            match next {
                Some(node) => {
                    if self.transfer_for_signal(node) {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    pub fn signal_all(&self) -> Result<(), SyncError> {
        self.check_held()?;

        let waiters = std::mem::take(&mut *self.waiters.lock());
        for node in waiters {
            self.transfer_for_signal(node);
        }
        Ok(())
    }

    pub fn has_waiters(&self) -> Result<bool, SyncError> {
        self.check_held()?;
        Ok(self
            .waiters
            .lock()
            .iter()
            .any(|node| node.status() == CONDITION))
    }

    pub fn wait_queue_length(&self) -> Result<usize, SyncError> {
        self.check_held()?;
        Ok(self
            .waiters
            .lock()
            .iter()
            .filter(|node| node.status() == CONDITION)
            .count())
    }

    pub fn waiting_threads(&self) -> Result<Vec<ThreadHandle>, SyncError> {
        self.check_held()?;
        Ok(self
            .waiters
            .lock()
            .iter()
            .filter(|node| node.status() == CONDITION)
            .map(|node| node.thread.clone())
            .collect())
    }

    fn check_held(&self) -> Result<(), SyncError> {
        if !self.sync.is_held_exclusively() {
            return Err(SyncError::IllegalMonitorState);
        }
        Ok(())
    }

    /// Returns whether the waiter was signalled before the deadline.
    fn wait_inner(&self, interruptible: bool, deadline: Deadline) -> Result<bool, SyncError> {
        if interruptible && thread::interrupted() {
            return Err(SyncError::Interrupted);
        }

        self.check_held()?;
        let node = Arc::new(WaitNode::on_condition(ThreadHandle::current()));
        self.waiters.lock().push_back(node.clone());
        let saved = self.fully_release(&node)?;

        let mut timed_out = false;
        let mut interrupt_mode = InterruptMode::None;

        while !node.is_queued() {
            match deadline.remaining() {
                Some(left) if left.is_zero() => {
                    timed_out = self.transfer_after_cancelled_wait(&node);
                    break;
                }
                Some(left) => thread::park_timeout(left),
                None => thread::park(),
            }

            if thread::interrupted() {
                if !interruptible {
                    interrupt_mode = InterruptMode::Reinterrupt;
                    continue;
                }
                interrupt_mode = if self.transfer_after_cancelled_wait(&node) {
                    InterruptMode::Fail
                } else {
                    InterruptMode::Reinterrupt
                };
                break;
            }
        }

        let outcome = self
            .sync
            .acquire_queued(&node, saved, false, Deadline::never());
        if outcome == (Outcome::Acquired { interrupted: true })
            && interrupt_mode != InterruptMode::Fail
        {
            interrupt_mode = InterruptMode::Reinterrupt;
        }

        match interrupt_mode {
            InterruptMode::Fail => Err(SyncError::Interrupted),
            InterruptMode::Reinterrupt => {
                thread::interrupt_current();
                Ok(!timed_out)
            }
            InterruptMode::None => Ok(!timed_out),
        }
    }

    fn fully_release(&self, node: &Arc<WaitNode>) -> Result<i64, SyncError> {
        let saved = self.sync.core().state();
        match self.sync.release(saved) {
            Ok(true) => Ok(saved),
            _ => {
                node.set_status(CANCELLED);
                self.unlink(node);
                Err(SyncError::IllegalMonitorState)
            }
        }
    }

    fn unlink(&self, node: &Arc<WaitNode>) {
        self.waiters
            .lock()
            .retain(|waiter| !Arc::ptr_eq(waiter, node));
    }

    fn transfer_for_signal(&self, node: Arc<WaitNode>) -> bool {
        if !node.compare_and_set_status(CONDITION, WAITING) {
            return false;
        }
        self.sync.core().enqueue(node);
        true
    }

    /// Moves a timed out or interrupted waiter to the lock queue. Returns
    /// `true` if this happened before a signal did.
    fn transfer_after_cancelled_wait(&self, node: &Arc<WaitNode>) -> bool {
        if node.compare_and_set_status(CONDITION, WAITING) {
            self.unlink(node);
            self.sync.core().enqueue(node.clone());
            return true;
        }

        // A signaller won the race and is about to enqueue the node.
        let backoff = Backoff::new();
        while !node.is_queued() {
            backoff.snooze();
        }
        false
    }
}

impl<P: Policy> fmt::Debug for ConditionObject<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionObject")
            .field("waiters", &self.waiters.lock().len())
            .finish()
    }
}
