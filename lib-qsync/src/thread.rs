//! Thread identity and cooperative interruption.
//!
//! Every thread that touches a synchronizer gets a [`ThreadHandle`] on first
//! use. The handle carries the thread's parker and its interrupt flag, so
//! blocked threads can be woken either by the synchronizer they wait on or by
//! another thread calling [`ThreadHandle::interrupt`].

use std::{
    fmt, io,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::*},
        Arc,
    },
    time::Duration,
};

use crossbeam::channel;

use crate::parker::Parker;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }

    pub(crate) fn from_raw(raw: u64) -> Option<ThreadId> {
        NonZeroU64::new(raw).map(ThreadId)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct ThreadRecord {
    id: ThreadId,
    name: Option<String>,
    interrupted: AtomicBool,
    parker: Parker,
}

#[derive(Clone)]
pub struct ThreadHandle {
    record: Arc<ThreadRecord>,
}

thread_local! {
    static CURRENT: ThreadHandle = ThreadHandle::register();
}

impl ThreadHandle {
    fn register() -> ThreadHandle {
        let raw = NEXT_THREAD_ID.fetch_add(1, Relaxed);
        let id = ThreadId::from_raw(raw).expect("thread id counter overflowed");

        ThreadHandle {
            record: Arc::new(ThreadRecord {
                id,
                name: std::thread::current().name().map(str::to_owned),
                interrupted: AtomicBool::new(false),
                parker: Parker::new(),
            }),
        }
    }

    pub fn current() -> ThreadHandle {
        CURRENT.with(ThreadHandle::clone)
    }

    pub fn id(&self) -> ThreadId {
        self.record.id
    }

    pub fn name(&self) -> Option<&str> {
        self.record.name.as_deref()
    }

    /// Sets the interrupt flag and wakes the thread if it is parked.
    pub fn interrupt(&self) {
        self.record.interrupted.store(true, Release);
        self.record.parker.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.record.interrupted.load(Acquire)
    }

    pub(crate) fn unpark(&self) {
        self.record.parker.unpark();
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ThreadHandle {}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Thread[{}, {}]", self.id(), name),
            None => write!(f, "Thread[{}]", self.id()),
        }
    }
}

pub fn current_id() -> ThreadId {
    CURRENT.with(|handle| handle.id())
}

/// Tests and clears the interrupt flag of the calling thread.
pub fn interrupted() -> bool {
    CURRENT.with(|handle| handle.record.interrupted.swap(false, AcqRel))
}

pub fn is_interrupted() -> bool {
    CURRENT.with(|handle| handle.is_interrupted())
}

/// Re-asserts an interrupt on the calling thread.
pub fn interrupt_current() {
    CURRENT.with(|handle| handle.interrupt());
}

pub(crate) fn park() {
    CURRENT.with(|handle| handle.record.parker.park());
}

pub(crate) fn park_timeout(timeout: Duration) {
    CURRENT.with(|handle| {
        handle.record.parker.park_timeout(timeout);
    });
}

#[derive(Debug)]
pub struct JoinHandle<T> {
    inner: std::thread::JoinHandle<T>,
    thread: ThreadHandle,
}

impl<T> JoinHandle<T> {
    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    pub fn interrupt(&self) {
        self.thread.interrupt();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn join(self) -> std::thread::Result<T> {
        self.inner.join()
    }
}

#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Spawns the thread and waits until its handle is registered, so the
    /// returned handle can interrupt it right away.
    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut builder = std::thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let (tx, rx) = channel::bounded(1);
        let inner = builder.spawn(move || {
            let _ = tx.send(ThreadHandle::current());
            f()
        })?;

        let thread = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "thread exited before starting"))?;

        Ok(JoinHandle { inner, thread })
    }
}

pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f).expect("failed to spawn thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_stable() {
        let here = current_id();
        assert_eq!(here, ThreadHandle::current().id());

        let there = spawn(current_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn interrupted_clears_the_flag() {
        assert!(!interrupted());
        interrupt_current();
        assert!(is_interrupted());
        assert!(interrupted());
        assert!(!is_interrupted());
    }

    #[test]
    fn interrupt_wakes_parked_thread() {
        let handle = spawn(|| {
            while !is_interrupted() {
                park();
            }
            interrupted()
        });

        handle.interrupt();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn builder_names_thread() {
        let handle = Builder::new()
            .name("worker-7")
            .spawn(|| ThreadHandle::current().name().map(str::to_owned))
            .unwrap();

        assert_eq!(handle.thread().name(), Some("worker-7"));
        assert_eq!(handle.join().unwrap().as_deref(), Some("worker-7"));
    }
}
