use std::fmt;

/// Unit of work accepted by a thread pool.
pub trait Job: Send + 'static {
    fn run(self);

    /// Cancelled jobs are dropped by [`purge`](super::ThreadPoolExecutor::purge).
    fn is_cancelled(&self) -> bool {
        false
    }

    /// Whether the job still runs if it is queued when the pool shuts down.
    fn keep_after_shutdown(&self) -> bool {
        true
    }

    /// Called when the pool discards the job without running it.
    fn cancel(&self) {}
}

/// Object safe form of a one-shot task.
pub trait Runnable: Send + 'static {
    fn run(self: Box<Self>);

    fn is_cancelled(&self) -> bool {
        false
    }

    fn cancel(&self) {}
}

impl<F: FnOnce() + Send + 'static> Runnable for F {
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// The job type of the plain thread pool.
pub struct BoxedJob(Box<dyn Runnable>);

impl BoxedJob {
    pub fn new(task: impl Runnable) -> Self {
        BoxedJob(Box::new(task))
    }
}

impl Job for BoxedJob {
    fn run(self) {
        self.0.run()
    }

    fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    fn cancel(&self) {
        self.0.cancel()
    }
}

impl fmt::Debug for BoxedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxedJob")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
