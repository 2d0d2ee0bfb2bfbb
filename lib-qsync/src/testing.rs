//! Timing helpers shared by the unit tests.

use std::time::{Duration, Instant};

use crate::{synchronizer::SyncCore, thread::ThreadHandle};

pub(crate) const SHORT_DELAY: Duration = Duration::from_millis(50);
pub(crate) const MEDIUM_DELAY: Duration = Duration::from_millis(200);
pub(crate) const LONG_DELAY: Duration = Duration::from_secs(10);

/// Spins until `pred` holds, failing the test after [`LONG_DELAY`].
pub(crate) fn await_until(what: &str, pred: impl Fn() -> bool) {
    let start = Instant::now();
    while !pred() {
        if start.elapsed() > LONG_DELAY {
            panic!("timed out waiting for {}", what);
        }
        std::thread::yield_now();
    }
}

pub(crate) fn await_queued(core: &SyncCore, thread: &ThreadHandle) {
    await_until("thread to queue", || core.is_queued(thread));
}
