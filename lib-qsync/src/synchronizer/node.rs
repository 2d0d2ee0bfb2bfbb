use std::sync::atomic::{AtomicBool, AtomicU8, Ordering::*};

use crate::thread::ThreadHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Exclusive,
    Shared,
}

pub(crate) const WAITING: u8 = 0;
pub(crate) const CONDITION: u8 = 1;
pub(crate) const CANCELLED: u8 = 2;

/// One blocked thread, either in the sync queue or on a condition.
#[derive(Debug)]
pub(crate) struct WaitNode {
    pub(crate) thread: ThreadHandle,
    pub(crate) mode: Mode,
    status: AtomicU8,
    queued: AtomicBool,
}

impl WaitNode {
    pub(crate) fn new(thread: ThreadHandle, mode: Mode) -> Self {
        Self {
            thread,
            mode,
            status: AtomicU8::new(WAITING),
            queued: AtomicBool::new(false),
        }
    }

    pub(crate) fn on_condition(thread: ThreadHandle) -> Self {
        Self {
            thread,
            mode: Mode::Exclusive,
            status: AtomicU8::new(CONDITION),
            queued: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> u8 {
        self.status.load(Acquire)
    }

    pub(crate) fn set_status(&self, status: u8) {
        self.status.store(status, Release);
    }

    pub(crate) fn compare_and_set_status(&self, expect: u8, update: u8) -> bool {
        self.status
            .compare_exchange(expect, update, AcqRel, Acquire)
            .is_ok()
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued.load(Acquire)
    }

    pub(crate) fn mark_queued(&self) {
        self.queued.store(true, Release);
    }
}
