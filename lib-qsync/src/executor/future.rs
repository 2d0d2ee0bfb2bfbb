use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use super::job::Runnable;
use crate::{error::SyncError, locks::CountDownLatch, spin_lock::SpinLock, thread::ThreadHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Completed,
    Cancelled,
}

struct Slot<R> {
    status: Status,
    outcome: Option<Result<R, SyncError>>,
    runner: Option<ThreadHandle>,
}

/// Completion state shared between a task and its [`TaskFuture`].
pub(crate) struct FutureCell<R> {
    slot: SpinLock<Slot<R>>,
    done: CountDownLatch,
}

impl<R> FutureCell<R> {
    pub(crate) fn new() -> Self {
        Self {
            slot: SpinLock::new(Slot {
                status: Status::Pending,
                outcome: None,
                runner: None,
            }),
            done: CountDownLatch::new(1),
        }
    }

    /// Claims the task for the calling thread. Fails if it already ran or
    /// was cancelled.
    pub(crate) fn begin(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.status != Status::Pending {
            return false;
        }
        slot.status = Status::Running;
        slot.runner = Some(ThreadHandle::current());
        true
    }

    pub(crate) fn complete(&self, outcome: Result<R, SyncError>) {
        {
            let mut slot = self.slot.lock();
            slot.runner = None;
            if slot.status == Status::Running {
                slot.status = Status::Completed;
                slot.outcome = Some(outcome);
            }
        }
        self.done.count_down();
    }

    /// Ends a periodic round. Returns `false` if the task was cancelled
    /// meanwhile and must not run again.
    pub(crate) fn reset(&self) -> bool {
        let mut slot = self.slot.lock();
        slot.runner = None;
        if slot.status == Status::Running {
            slot.status = Status::Pending;
            return true;
        }
        false
    }

    pub(crate) fn cancel(&self, may_interrupt: bool) -> bool {
        let runner = {
            let mut slot = self.slot.lock();
            match slot.status {
                Status::Pending | Status::Running => {
                    slot.status = Status::Cancelled;
                    slot.runner.take()
                }
                Status::Completed | Status::Cancelled => return false,
            }
        };

        if may_interrupt {
            if let Some(runner) = runner {
                runner.interrupt();
            }
        }
        self.done.count_down();
        true
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.slot.lock().status == Status::Cancelled
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.slot.lock().status, Status::Completed | Status::Cancelled)
    }

    fn outcome(&self) -> Result<R, SyncError>
    where
        R: Clone,
    {
        let slot = self.slot.lock();
        match (&slot.status, &slot.outcome) {
            (Status::Cancelled, _) => Err(SyncError::Cancelled),
            (_, Some(outcome)) => outcome.clone(),
            (_, None) => Err(SyncError::IllegalState("task has not completed")),
        }
    }

    fn take_outcome(&self) -> Result<R, SyncError> {
        let mut slot = self.slot.lock();
        match slot.status {
            Status::Cancelled => Err(SyncError::Cancelled),
            _ => slot
                .outcome
                .take()
                .unwrap_or(Err(SyncError::IllegalState("task has not completed"))),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_owned()
    }
}

/// Handle to the result of a submitted task.
pub struct TaskFuture<R> {
    cell: Arc<FutureCell<R>>,
}

impl<R> TaskFuture<R> {
    pub(crate) fn from_cell(cell: Arc<FutureCell<R>>) -> Self {
        Self { cell }
    }

    /// Attempts to cancel. A running task is only interrupted when
    /// `may_interrupt` is set, and it has to cooperate to actually stop.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.cell.cancel(may_interrupt)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// Blocks until the task is done, without reading its result.
    pub fn wait(&self) -> Result<(), SyncError> {
        self.cell.done.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.cell.done.wait_timeout(timeout)
    }

    pub fn get(&self) -> Result<R, SyncError>
    where
        R: Clone,
    {
        self.wait()?;
        self.cell.outcome()
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<R, SyncError>
    where
        R: Clone,
    {
        if !self.wait_timeout(timeout)? {
            return Err(SyncError::Timeout);
        }
        self.cell.outcome()
    }

    /// Waits for and moves out the result.
    pub fn join(self) -> Result<R, SyncError> {
        self.wait()?;
        self.cell.take_outcome()
    }
}

impl<R> fmt::Debug for TaskFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.cell.slot.lock().status;
        f.debug_struct("TaskFuture").field("status", &status).finish()
    }
}

/// A closure paired with the cell its result goes to.
pub struct FutureTask<R, F> {
    cell: Arc<FutureCell<R>>,
    body: F,
}

impl<R, F> FutureTask<R, F>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    pub fn new(body: F) -> (Self, TaskFuture<R>) {
        let cell = Arc::new(FutureCell::new());
        let future = TaskFuture::from_cell(cell.clone());
        (Self { cell, body }, future)
    }

    pub fn run(self) {
        if !self.cell.begin() {
            return;
        }
        let outcome = catch_unwind(AssertUnwindSafe(self.body))
            .map_err(|payload| SyncError::ExecutionFailed(panic_message(payload.as_ref())));
        self.cell.complete(outcome);
    }
}

impl<R, F> Runnable for FutureTask<R, F>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    fn run(self: Box<Self>) {
        FutureTask::run(*self)
    }

    fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }

    fn cancel(&self) {
        self.cell.cancel(false);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        testing::{await_until, SHORT_DELAY},
        thread::{self, spawn},
    };

    use super::*;

    #[test]
    fn run_delivers_result() {
        let (task, future) = FutureTask::new(|| 6 * 7);
        assert!(!future.is_done());
        task.run();
        assert!(future.is_done());
        assert_eq!(future.get(), Ok(42));
        assert_eq!(future.join(), Ok(42));
    }

    #[test]
    fn panic_becomes_execution_failure() {
        let (task, future) = FutureTask::new(|| -> u8 { panic!("bad input") });
        task.run();
        assert_eq!(
            future.get(),
            Err(SyncError::ExecutionFailed("bad input".to_owned()))
        );
    }

    #[test]
    fn cancelled_before_run_never_runs() {
        let (task, future) = FutureTask::new(|| unreachable!());
        assert!(future.cancel(false));
        assert!(!future.cancel(false));
        task.run();
        assert!(future.is_cancelled());
        assert_eq!(future.get(), Err(SyncError::Cancelled));
    }

    #[test]
    fn get_timeout_on_pending_task() {
        let (_task, future) = FutureTask::new(|| 1);
        assert_eq!(future.get_timeout(SHORT_DELAY), Err(SyncError::Timeout));
    }

    #[test]
    fn cancel_interrupts_runner() {
        let (task, future) = FutureTask::new(|| {
            while !thread::is_interrupted() {
                std::thread::yield_now();
            }
            "stopped"
        });
        let runner = spawn(move || task.run());

        await_until("task to start", || future.cell.slot.lock().status == Status::Running);
        assert!(future.cancel(true));
        runner.join().unwrap();
        assert_eq!(future.get(), Err(SyncError::Cancelled));
    }
}
