use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering::*},
        Arc,
    },
    time::Duration,
};

use strum::{Display, FromRepr};

use super::{
    future::panic_message, BoxedJob, DefaultThreadFactory, Job, RejectionPolicy, ThreadFactory,
};
use crate::{
    deadline::Deadline,
    error::SyncError,
    guarded::Guarded,
    locks::{Condition, Mutex, ReentrantLock},
    queue::BlockingQueue,
    spin_lock::SpinLock,
    thread::{self, ThreadHandle},
};

/// Lifecycle of a pool. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, FromRepr)]
#[repr(u8)]
pub enum RunState {
    /// Accepts new jobs and runs queued ones.
    Running,
    /// Rejects new jobs, still drains the queue.
    Shutdown,
    /// Rejects new jobs, abandons the queue, interrupts running jobs.
    Stop,
    /// All workers are gone, the `terminated` hook is running.
    Tidying,
    Terminated,
}

/// Callbacks around every job and at termination.
pub trait ExecutionHooks: Send + Sync {
    fn before_execute(&self, _worker: &ThreadHandle) {}

    /// `failure` carries the panic message of a job that panicked.
    fn after_execute(&self, _failure: Option<&str>) {}

    fn terminated(&self) {}
}

struct Worker<J> {
    id: u64,
    /// Held while a job runs, so idle workers are those whose lock is free.
    lock: Mutex,
    thread: SpinLock<Option<ThreadHandle>>,
    first: SpinLock<Option<J>>,
    completed: AtomicU64,
}

struct WorkerSet<J> {
    workers: HashMap<u64, Arc<Worker<J>>>,
    next_id: u64,
    largest: usize,
    completed: u64,
}

pub(crate) struct PoolInner<J: Job> {
    queue: Arc<dyn BlockingQueue<J>>,
    main_lock: ReentrantLock,
    termination: Condition,
    run_state: AtomicU8,
    worker_count: AtomicUsize,
    /// Guarded by `main_lock`.
    workers: Guarded<WorkerSet<J>>,
    core_pool_size: AtomicUsize,
    maximum_pool_size: AtomicUsize,
    keep_alive_nanos: AtomicU64,
    allow_core_timeout: AtomicBool,
    thread_factory: SpinLock<Arc<dyn ThreadFactory>>,
    rejection: SpinLock<RejectionPolicy<J>>,
    hooks: Option<Arc<dyn ExecutionHooks>>,
}

pub(crate) struct PoolSettings<J: Job> {
    pub(crate) core_pool_size: usize,
    pub(crate) maximum_pool_size: usize,
    pub(crate) keep_alive: Duration,
    pub(crate) allow_core_timeout: bool,
    pub(crate) queue: Arc<dyn BlockingQueue<J>>,
    pub(crate) thread_factory: Arc<dyn ThreadFactory>,
    pub(crate) rejection: RejectionPolicy<J>,
    pub(crate) hooks: Option<Arc<dyn ExecutionHooks>>,
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl<J: Job> PoolInner<J> {
    fn new(settings: PoolSettings<J>) -> Self {
        let main_lock = ReentrantLock::new();
        let termination = main_lock.new_condition();
        Self {
            queue: settings.queue,
            main_lock,
            termination,
            run_state: AtomicU8::new(RunState::Running as u8),
            worker_count: AtomicUsize::new(0),
            workers: Guarded::new(WorkerSet {
                workers: HashMap::new(),
                next_id: 0,
                largest: 0,
                completed: 0,
            }),
            core_pool_size: AtomicUsize::new(settings.core_pool_size),
            maximum_pool_size: AtomicUsize::new(settings.maximum_pool_size),
            keep_alive_nanos: AtomicU64::new(nanos(settings.keep_alive)),
            allow_core_timeout: AtomicBool::new(settings.allow_core_timeout),
            thread_factory: SpinLock::new(settings.thread_factory),
            rejection: SpinLock::new(settings.rejection),
            hooks: settings.hooks,
        }
    }

    pub(crate) fn run_state(&self) -> RunState {
        RunState::from_repr(self.run_state.load(Acquire))
            .unwrap_or_else(|| unreachable!("unexpected run state"))
    }

    fn advance_to(&self, target: RunState) {
        let previous = self.run_state.fetch_max(target as u8, AcqRel);
        if previous < target as u8 {
            log::debug!("thread pool entering {}", target);
        }
    }

    fn core_pool_size(&self) -> usize {
        self.core_pool_size.load(Acquire)
    }

    fn keep_alive(&self) -> Duration {
        Duration::from_nanos(self.keep_alive_nanos.load(Acquire))
    }

    /// `f` must not call back into `with_workers`.
    fn with_workers<R>(&self, f: impl FnOnce(&mut WorkerSet<J>) -> R) -> R {
        let _guard = self.main_lock.lock_guard();
        unsafe { self.workers.with(f) }
    }

    /// Queues `job` or hands a worker to it. Gives the job back when the
    /// pool cannot take it.
    fn try_execute(self: &Arc<Self>, job: J) -> Result<(), J> {
        let _guard = self.main_lock.lock_guard();
        if self.run_state() != RunState::Running {
            return Err(job);
        }

        let job = if self.worker_count.load(Acquire) < self.core_pool_size() {
            match self.add_worker(job, true) {
                Ok(()) => return Ok(()),
                Err(job) => job,
            }
        } else {
            job
        };

        match self.queue.offer(job) {
            Ok(()) => {
                if self.worker_count.load(Acquire) == 0 {
                    self.add_idle_worker(false);
                }
                Ok(())
            }
            Err(rejected) => self.add_worker(rejected.into_inner(), false),
        }
    }

    /// Puts a job back on the queue if `allowed` still holds for the
    /// current run state.
    pub(crate) fn requeue(
        self: &Arc<Self>,
        job: J,
        allowed: impl FnOnce(RunState) -> bool,
    ) -> Result<(), J> {
        let _guard = self.main_lock.lock_guard();
        if !allowed(self.run_state()) {
            return Err(job);
        }
        self.queue.offer(job).map_err(|rejected| rejected.into_inner())?;
        self.ensure_prestart();
        Ok(())
    }

    pub(crate) fn ensure_prestart(self: &Arc<Self>) {
        if self.worker_count.load(Acquire) < self.core_pool_size() {
            self.add_idle_worker(true);
        } else if self.worker_count.load(Acquire) == 0 {
            self.add_idle_worker(false);
        }
    }

    fn add_worker(self: &Arc<Self>, first: J, core: bool) -> Result<(), J> {
        match self.start_worker(Some(first), core) {
            Ok(()) => Ok(()),
            Err(Some(job)) => Err(job),
            Err(None) => unreachable!("unexpected state: worker lost its first job"),
        }
    }

    fn add_idle_worker(self: &Arc<Self>, core: bool) -> bool {
        self.start_worker(None, core).is_ok()
    }

    fn start_worker(self: &Arc<Self>, first: Option<J>, core: bool) -> Result<(), Option<J>> {
        let _guard = self.main_lock.lock_guard();

        let state = self.run_state();
        if state >= RunState::Stop
            || (state == RunState::Shutdown && (first.is_some() || self.queue.is_empty()))
        {
            return Err(first);
        }

        let bound = if core {
            self.core_pool_size()
        } else {
            self.maximum_pool_size.load(Acquire)
        };
        if self.worker_count.load(Acquire) >= bound {
            return Err(first);
        }
        self.worker_count.fetch_add(1, AcqRel);

        let worker = unsafe {
            self.workers.with(|set| {
                let worker = Arc::new(Worker {
                    id: set.next_id,
                    lock: Mutex::new(),
                    thread: SpinLock::new(None),
                    first: SpinLock::new(first),
                    completed: AtomicU64::new(0),
                });
                set.next_id += 1;
                set.workers.insert(worker.id, worker.clone());
                set.largest = set.largest.max(set.workers.len());
                worker
            })
        };

        let factory = self.thread_factory.lock().clone();
        let pool = self.clone();
        let runner = worker.clone();
        match factory.new_thread(Box::new(move || run_worker(pool, runner))) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("thread factory failed to start worker {}: {}", worker.id, err);
                unsafe {
                    self.workers.with(|set| set.workers.remove(&worker.id));
                }
                self.worker_count.fetch_sub(1, AcqRel);
                self.try_terminate();
                let first = worker.first.lock().take();
                Err(first)
            }
        }
    }

    fn get_task(&self) -> Option<J> {
        let mut timed_out = false;
        loop {
            let state = self.run_state();
            if state >= RunState::Shutdown && (state >= RunState::Stop || self.queue.is_empty()) {
                self.worker_count.fetch_sub(1, AcqRel);
                return None;
            }

            let count = self.worker_count.load(Acquire);
            let timed = self.allow_core_timeout.load(Acquire) || count > self.core_pool_size();

            if (count > self.maximum_pool_size.load(Acquire) || (timed && timed_out))
                && (count > 1 || self.queue.is_empty())
            {
                if self
                    .worker_count
                    .compare_exchange(count, count - 1, AcqRel, Acquire)
                    .is_ok()
                {
                    return None;
                }
                continue;
            }

            let next = if timed {
                self.queue.poll_timeout(self.keep_alive())
            } else {
                self.queue.take().map(Some)
            };
            match next {
                Ok(Some(job)) => return Some(job),
                Ok(None) => timed_out = true,
                Err(_) => timed_out = false,
            }
        }
    }

    fn process_worker_exit(self: &Arc<Self>, worker: &Worker<J>, abrupt: bool) {
        if abrupt {
            self.worker_count.fetch_sub(1, AcqRel);
        }
        self.with_workers(|set| {
            set.completed += worker.completed.load(Acquire);
            set.workers.remove(&worker.id);
        });
        log::debug!("worker {} exited", worker.id);

        self.try_terminate();

        if self.run_state() < RunState::Stop {
            if !abrupt {
                let mut min = if self.allow_core_timeout.load(Acquire) {
                    0
                } else {
                    self.core_pool_size()
                };
                if min == 0 && !self.queue.is_empty() {
                    min = 1;
                }
                if self.worker_count.load(Acquire) >= min {
                    return;
                }
            }
            self.add_idle_worker(false);
        }
    }

    fn try_terminate(&self) {
        loop {
            let state = self.run_state();
            if state == RunState::Running
                || state >= RunState::Tidying
                || (state == RunState::Shutdown && !self.queue.is_empty())
            {
                return;
            }
            if self.worker_count.load(Acquire) != 0 {
                self.interrupt_idle_workers(true);
                return;
            }

            let _guard = self.main_lock.lock_guard();
            if self
                .run_state
                .compare_exchange(state as u8, RunState::Tidying as u8, AcqRel, Acquire)
                .is_ok()
            {
                log::debug!("thread pool entering {}", RunState::Tidying);
                if let Some(hooks) = &self.hooks {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hooks.terminated())) {
                        log::warn!("terminated hook panicked: {}", panic_message(payload.as_ref()));
                    }
                }
                self.advance_to(RunState::Terminated);
                let _ = self.termination.signal_all();
                return;
            }
        }
    }

    fn interrupt_idle_workers(&self, only_one: bool) {
        self.with_workers(|set| {
            for worker in set.workers.values() {
                if let Some(thread) = worker.thread.lock().as_ref() {
                    if !thread.is_interrupted() && worker.lock.try_lock() {
                        thread.interrupt();
                        let _ = worker.lock.unlock();
                    }
                }
                if only_one {
                    break;
                }
            }
        });
    }

    fn interrupt_workers(&self) {
        self.with_workers(|set| {
            for worker in set.workers.values() {
                if let Some(thread) = worker.thread.lock().as_ref() {
                    thread.interrupt();
                }
            }
        });
    }

    /// Drops queued jobs that must not outlive `shutdown`.
    fn on_shutdown(&self) {
        let dropped = self
            .queue
            .remove_where(&mut |job| !job.keep_after_shutdown() || job.is_cancelled());
        for job in dropped {
            job.cancel();
        }
    }

    fn shutdown(&self) {
        {
            let _guard = self.main_lock.lock_guard();
            self.advance_to(RunState::Shutdown);
            self.interrupt_idle_workers(false);
            self.on_shutdown();
        }
        self.try_terminate();
    }

    fn drain_queue(&self) -> Vec<J> {
        let mut drained = Vec::new();
        self.queue.drain_to(&mut drained);
        if !self.queue.is_empty() {
            drained.extend(self.queue.remove_where(&mut |_| true));
        }
        drained
    }
}

/// Decrements the pool's bookkeeping when a worker thread ends, including
/// by a panicking hook.
struct WorkerExit<J: Job> {
    pool: Arc<PoolInner<J>>,
    worker: Arc<Worker<J>>,
    abrupt: bool,
}

impl<J: Job> Drop for WorkerExit<J> {
    fn drop(&mut self) {
        self.pool.process_worker_exit(&self.worker, self.abrupt);
    }
}

fn run_worker<J: Job>(pool: Arc<PoolInner<J>>, worker: Arc<Worker<J>>) {
    let current = ThreadHandle::current();
    *worker.thread.lock() = Some(current.clone());
    log::debug!("worker {} started on {}", worker.id, current);

    let mut exit = WorkerExit {
        pool: pool.clone(),
        worker: worker.clone(),
        abrupt: true,
    };
    let mut task = worker.first.lock().take();

    loop {
        let job = match task.take().or_else(|| pool.get_task()) {
            Some(job) => job,
            None => break,
        };

        worker.lock.lock();
        // A stopping pool leaves the interrupt set; otherwise clear any left
        // over from an idle interrupt.
        if pool.run_state() >= RunState::Stop {
            thread::interrupt_current();
        } else {
            thread::interrupted();
            if pool.run_state() >= RunState::Stop {
                thread::interrupt_current();
            }
        }

        if let Some(hooks) = &pool.hooks {
            hooks.before_execute(&current);
        }
        let failure = catch_unwind(AssertUnwindSafe(|| job.run()))
            .err()
            .map(|payload| panic_message(payload.as_ref()));
        if let Some(message) = &failure {
            log::warn!("job panicked on worker {}: {}", worker.id, message);
        }
        if let Some(hooks) = &pool.hooks {
            hooks.after_execute(failure.as_deref());
        }

        worker.completed.fetch_add(1, AcqRel);
        let _ = worker.lock.unlock();
    }

    exit.abrupt = false;
}

/// A pool of worker threads fed from a [`BlockingQueue`].
///
/// Up to `core_pool_size` workers are started as jobs arrive. Beyond that
/// jobs are queued, and only when the queue refuses one does the pool grow
/// towards `maximum_pool_size`. Workers above the core size (or all of them
/// with `allow_core_thread_timeout`) exit after `keep_alive` without work.
/// Dropping the pool shuts it down without waiting.
pub struct ThreadPoolExecutor<J: Job = BoxedJob> {
    inner: Arc<PoolInner<J>>,
}

impl<J: Job> ThreadPoolExecutor<J> {
    pub(crate) fn from_settings(settings: PoolSettings<J>) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(settings)),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner<J>> {
        &self.inner
    }

    /// Runs `job` on some worker, or hands it to the rejection policy.
    pub fn execute_job(&self, job: J) -> Result<(), SyncError> {
        match self.inner.try_execute(job) {
            Ok(()) => Ok(()),
            Err(job) => self.reject(job),
        }
    }

    pub(crate) fn reject(&self, job: J) -> Result<(), SyncError> {
        let policy = self.inner.rejection.lock().clone();
        log::debug!("job rejected by {:?} pool, policy {:?}", self.run_state(), policy);
        policy.reject(job, self)
    }

    /// Stops accepting jobs. Queued jobs still run, except those whose
    /// [`Job::keep_after_shutdown`] is false. Does not wait.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Stops accepting jobs, interrupts every worker and returns the jobs
    /// that never started.
    pub fn shutdown_now(&self) -> Vec<J> {
        let drained = {
            let _guard = self.inner.main_lock.lock_guard();
            self.inner.advance_to(RunState::Stop);
            self.inner.interrupt_workers();
            self.inner.drain_queue()
        };
        self.inner.try_terminate();
        drained
    }

    pub fn is_shutdown(&self) -> bool {
        self.run_state() != RunState::Running
    }

    /// Shut down but not yet terminated.
    pub fn is_terminating(&self) -> bool {
        let state = self.run_state();
        state != RunState::Running && state < RunState::Terminated
    }

    pub fn is_terminated(&self) -> bool {
        self.run_state() == RunState::Terminated
    }

    pub fn run_state(&self) -> RunState {
        self.inner.run_state()
    }

    /// Blocks until terminated. `Ok(false)` if `timeout` elapsed first.
    pub fn await_termination(&self, timeout: Duration) -> Result<bool, SyncError> {
        let deadline = Deadline::after(timeout);
        let _guard = self.inner.main_lock.lock_guard();
        while self.run_state() < RunState::Terminated {
            match deadline.remaining() {
                Some(left) if left.is_zero() => return Ok(false),
                Some(left) => {
                    self.inner.termination.wait_for(left)?;
                }
                None => self.inner.termination.wait()?,
            }
        }
        Ok(true)
    }

    pub fn queue(&self) -> &Arc<dyn BlockingQueue<J>> {
        &self.inner.queue
    }

    /// Removes queued jobs matching `pred`. They are returned unrun.
    pub fn remove_where(&self, mut pred: impl FnMut(&J) -> bool) -> Vec<J> {
        let removed = self.inner.queue.remove_where(&mut pred);
        self.inner.try_terminate();
        removed
    }

    /// Drops cancelled jobs from the queue. Returns how many went.
    pub fn purge(&self) -> usize {
        self.remove_where(|job| job.is_cancelled()).len()
    }

    /// Starts an idle core worker. `false` if all core workers exist.
    pub fn prestart_core_thread(&self) -> bool {
        self.inner.worker_count.load(Acquire) < self.inner.core_pool_size()
            && self.inner.add_idle_worker(true)
    }

    pub fn prestart_all_core_threads(&self) -> usize {
        let mut started = 0;
        while self.inner.add_idle_worker(true) {
            started += 1;
        }
        started
    }

    pub fn core_pool_size(&self) -> usize {
        self.inner.core_pool_size()
    }

    pub fn set_core_pool_size(&self, size: usize) -> Result<(), SyncError> {
        if size > self.maximum_pool_size() {
            return Err(SyncError::IllegalArgument("core pool size exceeds maximum"));
        }
        let previous = self.inner.core_pool_size.swap(size, AcqRel);
        if self.inner.worker_count.load(Acquire) > size {
            self.inner.interrupt_idle_workers(false);
        } else if size > previous {
            // Start no more new workers than there are queued jobs.
            let mut wanted = (size - previous).min(self.inner.queue.len());
            while wanted > 0 && self.inner.add_idle_worker(true) {
                wanted -= 1;
                if self.inner.queue.is_empty() {
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn maximum_pool_size(&self) -> usize {
        self.inner.maximum_pool_size.load(Acquire)
    }

    pub fn set_maximum_pool_size(&self, size: usize) -> Result<(), SyncError> {
        if size == 0 || size < self.core_pool_size() {
            return Err(SyncError::IllegalArgument(
                "maximum pool size must be positive and at least the core size",
            ));
        }
        self.inner.maximum_pool_size.store(size, Release);
        if self.inner.worker_count.load(Acquire) > size {
            self.inner.interrupt_idle_workers(false);
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        self.inner.keep_alive()
    }

    pub fn set_keep_alive(&self, keep_alive: Duration) -> Result<(), SyncError> {
        if keep_alive.is_zero() && self.allows_core_thread_timeout() {
            return Err(SyncError::IllegalArgument(
                "core threads must have nonzero keep alive times",
            ));
        }
        let previous = self.inner.keep_alive_nanos.swap(nanos(keep_alive), AcqRel);
        if nanos(keep_alive) < previous {
            self.inner.interrupt_idle_workers(false);
        }
        Ok(())
    }

    pub fn allows_core_thread_timeout(&self) -> bool {
        self.inner.allow_core_timeout.load(Acquire)
    }

    pub fn allow_core_thread_timeout(&self, value: bool) -> Result<(), SyncError> {
        if value && self.keep_alive().is_zero() {
            return Err(SyncError::IllegalArgument(
                "core threads must have nonzero keep alive times",
            ));
        }
        if self.inner.allow_core_timeout.swap(value, AcqRel) != value && value {
            self.inner.interrupt_idle_workers(false);
        }
        Ok(())
    }

    pub fn thread_factory(&self) -> Arc<dyn ThreadFactory> {
        self.inner.thread_factory.lock().clone()
    }

    pub fn set_thread_factory(&self, factory: Arc<dyn ThreadFactory>) {
        *self.inner.thread_factory.lock() = factory;
    }

    pub fn rejection_policy(&self) -> RejectionPolicy<J> {
        self.inner.rejection.lock().clone()
    }

    pub fn set_rejection_policy(&self, policy: RejectionPolicy<J>) {
        *self.inner.rejection.lock() = policy;
    }

    /// Workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.inner
            .with_workers(|set| set.workers.values().filter(|w| w.lock.is_locked()).count())
    }

    pub fn pool_size(&self) -> usize {
        if self.run_state() >= RunState::Tidying {
            return 0;
        }
        self.inner.with_workers(|set| set.workers.len())
    }

    pub fn largest_pool_size(&self) -> usize {
        self.inner.with_workers(|set| set.largest)
    }

    /// Jobs ever scheduled: completed, running and queued. Approximate.
    pub fn task_count(&self) -> u64 {
        let queued = self.inner.queue.len() as u64;
        self.inner.with_workers(|set| {
            set.workers.values().fold(set.completed + queued, |total, worker| {
                let running = u64::from(worker.lock.is_locked());
                total + worker.completed.load(Acquire) + running
            })
        })
    }

    pub fn completed_task_count(&self) -> u64 {
        self.inner.with_workers(|set| {
            set.workers
                .values()
                .fold(set.completed, |total, worker| total + worker.completed.load(Acquire))
        })
    }
}

impl ThreadPoolExecutor<BoxedJob> {
    /// A pool with an unbounded queue and the default factory and policy.
    pub fn new(core_pool_size: usize, maximum_pool_size: usize, keep_alive: Duration) -> Result<Self, SyncError> {
        super::ThreadPoolBuilder::new()
            .core_pool_size(core_pool_size)
            .maximum_pool_size(maximum_pool_size)
            .keep_alive(keep_alive)
            .build()
    }

    /// `threads` workers that never time out.
    pub fn fixed(threads: usize) -> Result<Self, SyncError> {
        Self::new(threads, threads, Duration::ZERO)
    }
}

impl<J: Job> Drop for ThreadPoolExecutor<J> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl<J: Job> fmt::Display for ThreadPoolExecutor<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, pool size = {}, active threads = {}, queued tasks = {}, completed tasks = {}]",
            self.run_state(),
            self.pool_size(),
            self.active_count(),
            self.inner.queue.len(),
            self.completed_task_count()
        )
    }
}

impl<J: Job> fmt::Debug for ThreadPoolExecutor<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("run_state", &self.run_state())
            .field("core_pool_size", &self.core_pool_size())
            .field("maximum_pool_size", &self.maximum_pool_size())
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

pub(crate) fn default_thread_factory() -> Arc<dyn ThreadFactory> {
    Arc::new(DefaultThreadFactory::new())
}
