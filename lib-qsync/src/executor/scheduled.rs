//! Delayed and periodic execution on top of [`ThreadPoolExecutor`] and a
//! [`DelayQueue`].

use std::{
    cmp::Ordering,
    fmt,
    ops::Deref,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering::*},
        Arc, Weak,
    },
    time::Duration,
};

use quanta::Instant;

use super::{
    future::{panic_message, FutureCell},
    pool::{PoolInner, RunState},
    BoxedJob, ExecutorService, Job, TaskFuture, ThreadPoolBuilder, ThreadPoolExecutor,
};
use crate::{
    error::SyncError,
    locks::QueuedMutex,
    queue::{expiry_after, DelayQueue, Delayed},
    spin_lock::SpinLock,
};

// Idle non-core workers linger this long.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    Once,
    FixedRate(Duration),
    FixedDelay(Duration),
}

/// One run of a scheduled task. Returns whether the task wants another.
trait ScheduledBody: Send + Sync {
    fn run_round(&self) -> bool;

    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

struct OneShot<R, F> {
    cell: Arc<FutureCell<R>>,
    body: SpinLock<Option<F>>,
}

impl<R, F> ScheduledBody for OneShot<R, F>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    fn run_round(&self) -> bool {
        let Some(body) = self.body.lock().take() else {
            return false;
        };
        if self.cell.begin() {
            let outcome = catch_unwind(AssertUnwindSafe(body))
                .map_err(|payload| SyncError::ExecutionFailed(panic_message(payload.as_ref())));
            self.cell.complete(outcome);
        }
        false
    }

    fn cancel(&self) {
        self.cell.cancel(false);
    }

    fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }
}

struct Periodic<F> {
    cell: Arc<FutureCell<()>>,
    body: QueuedMutex<F>,
}

impl<F> ScheduledBody for Periodic<F>
where
    F: FnMut() + Send + 'static,
{
    fn run_round(&self) -> bool {
        if !self.cell.begin() {
            return false;
        }
        let outcome = {
            let mut body = self.body.lock();
            catch_unwind(AssertUnwindSafe(|| (*body)()))
        };
        match outcome {
            Ok(()) => self.cell.reset(),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::warn!("periodic task panicked, no further runs: {}", message);
                self.cell.complete(Err(SyncError::ExecutionFailed(message)));
                false
            }
        }
    }

    fn cancel(&self) {
        self.cell.cancel(false);
    }

    fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }
}

/// A task sitting in a [`ScheduledThreadPool`]'s delay queue.
pub struct ScheduledJob {
    at: Instant,
    seq: u64,
    period: Period,
    body: Arc<dyn ScheduledBody>,
    next_run: Arc<SpinLock<Instant>>,
    pool: Weak<PoolInner<ScheduledJob>>,
}

impl ScheduledJob {
    pub fn is_periodic(&self) -> bool {
        self.period != Period::Once
    }

    pub fn delay(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    fn can_run_in(&self, state: RunState) -> bool {
        match state {
            RunState::Running => true,
            RunState::Shutdown => !self.is_periodic(),
            _ => false,
        }
    }

    /// The same task, due for its next round.
    fn next_round(self) -> Option<ScheduledJob> {
        let at = match self.period {
            Period::Once => return None,
            Period::FixedRate(period) => self.at.checked_add(period)?,
            Period::FixedDelay(period) => Instant::now().checked_add(period)?,
        };
        *self.next_run.lock() = at;
        Some(ScheduledJob { at, ..self })
    }
}

impl Job for ScheduledJob {
    fn run(self) {
        let Some(pool) = self.pool.upgrade() else {
            self.body.cancel();
            return;
        };
        if !self.can_run_in(pool.run_state()) {
            self.body.cancel();
            return;
        }
        if !self.body.run_round() {
            return;
        }

        let Some(next) = self.next_round() else {
            return;
        };
        if let Err(next) = pool.requeue(next, |state| state == RunState::Running) {
            next.body.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.body.is_cancelled()
    }

    fn keep_after_shutdown(&self) -> bool {
        !self.is_periodic()
    }

    fn cancel(&self) {
        self.body.cancel();
    }
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledJob {}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

impl Delayed for ScheduledJob {
    fn remaining_delay(&self) -> Duration {
        self.delay()
    }
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("seq", &self.seq)
            .field("period", &self.period)
            .field("delay", &self.delay())
            .field("cancelled", &self.body.is_cancelled())
            .finish()
    }
}

/// Result handle of a scheduled task. Periodic tasks only complete when
/// cancelled or when a run panics.
pub struct ScheduledFuture<R> {
    future: TaskFuture<R>,
    next_run: Arc<SpinLock<Instant>>,
}

impl<R> ScheduledFuture<R> {
    /// Time left until the next run is due.
    pub fn delay(&self) -> Duration {
        self.next_run.lock().saturating_duration_since(Instant::now())
    }

    pub fn into_future(self) -> TaskFuture<R> {
        self.future
    }
}

impl<R> Deref for ScheduledFuture<R> {
    type Target = TaskFuture<R>;

    fn deref(&self) -> &TaskFuture<R> {
        &self.future
    }
}

impl<R> fmt::Debug for ScheduledFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledFuture")
            .field("future", &self.future)
            .field("delay", &self.delay())
            .finish()
    }
}

/// A thread pool that runs tasks after a delay or periodically.
///
/// Delayed one-shot tasks still run after
/// [`shutdown`](ExecutorService::shutdown);
/// periodic ones are cancelled by it.
pub struct ScheduledThreadPool {
    executor: ThreadPoolExecutor<ScheduledJob>,
    sequence: AtomicU64,
}

impl ScheduledThreadPool {
    pub fn new(core_pool_size: usize) -> Result<Self, SyncError> {
        let executor = ThreadPoolBuilder::<ScheduledJob>::default()
            .core_pool_size(core_pool_size)
            .maximum_pool_size(usize::MAX)
            .keep_alive(DEFAULT_KEEP_ALIVE)
            .queue(DelayQueue::new())
            .build()?;
        Ok(Self {
            executor,
            sequence: AtomicU64::new(0),
        })
    }

    /// The underlying pool, for statistics and tuning.
    pub fn executor(&self) -> &ThreadPoolExecutor<ScheduledJob> {
        &self.executor
    }

    fn enqueue<R>(
        &self,
        delay: Duration,
        period: Period,
        body: Arc<dyn ScheduledBody>,
        future: TaskFuture<R>,
    ) -> Result<ScheduledFuture<R>, SyncError> {
        let at = expiry_after(delay);
        let next_run = Arc::new(SpinLock::new(at));
        let job = ScheduledJob {
            at,
            seq: self.sequence.fetch_add(1, Relaxed),
            period,
            body,
            next_run: next_run.clone(),
            pool: Arc::downgrade(self.executor.inner()),
        };

        if let Err(job) = self
            .executor
            .inner()
            .requeue(job, |state| state == RunState::Running)
        {
            self.executor.reject(job)?;
        }
        Ok(ScheduledFuture { future, next_run })
    }

    /// Runs `f` once after `delay`.
    pub fn schedule<R, F>(&self, delay: Duration, f: F) -> Result<ScheduledFuture<R>, SyncError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let cell = Arc::new(FutureCell::new());
        let future = TaskFuture::from_cell(cell.clone());
        let body = Arc::new(OneShot {
            cell,
            body: SpinLock::new(Some(f)),
        });
        self.enqueue(delay, Period::Once, body, future)
    }

    /// Runs `f` once after `delay` and completes with `value`.
    pub fn schedule_value<R, F>(
        &self,
        delay: Duration,
        f: F,
        value: R,
    ) -> Result<ScheduledFuture<R>, SyncError>
    where
        F: FnOnce() + Send + 'static,
        R: Send + 'static,
    {
        self.schedule(delay, move || {
            f();
            value
        })
    }

    fn schedule_periodic<F>(
        &self,
        initial_delay: Duration,
        period: Period,
        f: F,
    ) -> Result<ScheduledFuture<()>, SyncError>
    where
        F: FnMut() + Send + 'static,
    {
        let cell = Arc::new(FutureCell::new());
        let future = TaskFuture::from_cell(cell.clone());
        let body = Arc::new(Periodic {
            cell,
            body: QueuedMutex::new(f),
        });
        self.enqueue(initial_delay, period, body, future)
    }

    /// Runs `f` every `period` measured between start times. Runs never
    /// overlap; a late run shifts later ones.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<ScheduledFuture<()>, SyncError>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(SyncError::IllegalArgument("period must be positive"));
        }
        self.schedule_periodic(initial_delay, Period::FixedRate(period), f)
    }

    /// Runs `f` repeatedly with `delay` between the end of one run and the
    /// start of the next.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: F,
    ) -> Result<ScheduledFuture<()>, SyncError>
    where
        F: FnMut() + Send + 'static,
    {
        if delay.is_zero() {
            return Err(SyncError::IllegalArgument("delay must be positive"));
        }
        self.schedule_periodic(initial_delay, Period::FixedDelay(delay), f)
    }
}

impl ExecutorService for ScheduledThreadPool {
    type Pending = ScheduledJob;

    fn execute_boxed(&self, job: BoxedJob) -> Result<(), SyncError> {
        self.schedule(Duration::ZERO, move || job.run()).map(drop)
    }

    fn shutdown(&self) {
        self.executor.shutdown()
    }

    fn shutdown_now(&self) -> Vec<ScheduledJob> {
        self.executor.shutdown_now()
    }

    fn is_shutdown(&self) -> bool {
        self.executor.is_shutdown()
    }

    fn is_terminated(&self) -> bool {
        self.executor.is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.executor.await_termination(timeout)
    }
}

impl fmt::Debug for ScheduledThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledThreadPool")
            .field("executor", &self.executor)
            .finish()
    }
}
