use std::{
    io,
    sync::atomic::{AtomicUsize, Ordering::*},
};

/// Creates the threads a pool runs its workers on.
pub trait ThreadFactory: Send + Sync {
    fn new_thread(&self, body: Box<dyn FnOnce() + Send>) -> io::Result<()>;
}

static POOL_NUMBER: AtomicUsize = AtomicUsize::new(1);

/// Names threads `pool-N-thread-M`.
#[derive(Debug)]
pub struct DefaultThreadFactory {
    prefix: String,
    thread_number: AtomicUsize,
    stack_size: Option<usize>,
}

impl Default for DefaultThreadFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultThreadFactory {
    pub fn new() -> Self {
        let pool = POOL_NUMBER.fetch_add(1, Relaxed);
        Self::with_prefix(format!("pool-{}-thread-", pool))
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            thread_number: AtomicUsize::new(1),
            stack_size: None,
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

impl ThreadFactory for DefaultThreadFactory {
    fn new_thread(&self, body: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        let name = format!("{}{}", self.prefix, self.thread_number.fetch_add(1, Relaxed));
        let mut builder = std::thread::Builder::new().name(name);
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(body).map(drop)
    }
}
