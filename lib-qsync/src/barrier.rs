use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering::*},
        Arc,
    },
    time::Duration,
};

use crate::{
    deadline::Deadline,
    error::SyncError,
    guarded::Guarded,
    locks::{Condition, ReentrantLock},
    thread,
};

#[derive(Debug, Default)]
struct Generation {
    broken: AtomicBool,
}

struct BarrierState {
    count: usize,
    generation: Arc<Generation>,
}

type BarrierAction = Box<dyn Fn() + Send + Sync>;

/// Lets a fixed number of parties wait for each other, then resets for the
/// next round. If any party leaves early (interrupt, timeout, a panicking
/// barrier action) the current round is broken for everybody.
pub struct CyclicBarrier {
    lock: ReentrantLock,
    trip: Condition,
    parties: usize,
    action: Option<BarrierAction>,
    state: Guarded<BarrierState>,
}

impl CyclicBarrier {
    pub fn new(parties: usize) -> Result<Self, SyncError> {
        Self::build(parties, None)
    }

    /// `action` runs on the last arriving thread before the others resume.
    pub fn with_action(
        parties: usize,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, SyncError> {
        Self::build(parties, Some(Box::new(action)))
    }

    fn build(parties: usize, action: Option<BarrierAction>) -> Result<Self, SyncError> {
        if parties == 0 {
            return Err(SyncError::IllegalArgument("parties must be positive"));
        }
        let lock = ReentrantLock::new();
        let trip = lock.new_condition();

        Ok(Self {
            lock,
            trip,
            parties,
            action,
            state: Guarded::new(BarrierState {
                count: parties,
                generation: Arc::default(),
            }),
        })
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Waits for every party. Returns the arrival index, `parties - 1` for
    /// the first to arrive down to zero for the last.
    pub fn wait(&self) -> Result<usize, SyncError> {
        self.dowait(None)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<usize, SyncError> {
        self.dowait(Some(Deadline::after(timeout)))
    }

    pub fn is_broken(&self) -> bool {
        let _guard = self.lock.lock_guard();
        unsafe { self.state.with(|state| state.generation.broken.load(Acquire)) }
    }

    pub fn number_waiting(&self) -> usize {
        let _guard = self.lock.lock_guard();
        unsafe { self.state.with(|state| self.parties - state.count) }
    }

    /// Breaks the current round, failing its waiters, and starts a new one.
    pub fn reset(&self) {
        let _guard = self.lock.lock_guard();
        self.break_barrier();
        self.next_generation();
    }

    fn dowait(&self, deadline: Option<Deadline>) -> Result<usize, SyncError> {
        let _guard = self.lock.lock_guard();

        let generation = unsafe { self.state.with(|state| state.generation.clone()) };
        if generation.broken.load(Acquire) {
            return Err(SyncError::BrokenBarrier);
        }
        if thread::interrupted() {
            self.break_barrier();
            return Err(SyncError::Interrupted);
        }

        let index = unsafe {
            self.state.with(|state| {
                state.count -= 1;
                state.count
            })
        };

        if index == 0 {
            if let Some(action) = &self.action {
                if catch_unwind(AssertUnwindSafe(action)).is_err() {
                    log::warn!("barrier action panicked, breaking the barrier");
                    self.break_barrier();
                    return Err(SyncError::ExecutionFailed(
                        "barrier action panicked".to_owned(),
                    ));
                }
            }
            self.next_generation();
            return Ok(0);
        }

        loop {
            let waited = match deadline {
                None => self.trip.wait(),
                Some(deadline) => self
                    .trip
                    .wait_timeout(deadline.remaining().unwrap_or(Duration::MAX))
                    .map(drop),
            };

            if let Err(err) = waited {
                if self.is_current(&generation) && !generation.broken.load(Acquire) {
                    self.break_barrier();
                    return Err(err);
                }
                // The round completed anyway, keep the interrupt for later.
                thread::interrupt_current();
            }

            if generation.broken.load(Acquire) {
                return Err(SyncError::BrokenBarrier);
            }
            if !self.is_current(&generation) {
                return Ok(index);
            }
            if deadline.is_some_and(|deadline| deadline.has_elapsed()) {
                self.break_barrier();
                return Err(SyncError::Timeout);
            }
        }
    }

    fn is_current(&self, generation: &Arc<Generation>) -> bool {
        unsafe { self.state.with(|state| Arc::ptr_eq(&state.generation, generation)) }
    }

    fn break_barrier(&self) {
        unsafe {
            self.state.with(|state| {
                state.generation.broken.store(true, Release);
                state.count = self.parties;
            })
        };
        let _ = self.trip.signal_all();
    }

    fn next_generation(&self) {
        let _ = self.trip.signal_all();
        unsafe {
            self.state.with(|state| {
                state.count = self.parties;
                state.generation = Arc::default();
            })
        };
    }
}

impl fmt::Debug for CyclicBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CyclicBarrier")
            .field("parties", &self.parties)
            .field("waiting", &self.number_waiting())
            .finish()
    }
}
