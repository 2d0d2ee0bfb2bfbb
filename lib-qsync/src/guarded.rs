use std::cell::UnsafeCell;

/// State protected by a lock that lives elsewhere, typically the
/// [`ReentrantLock`](crate::locks::ReentrantLock) of the owning structure.
pub(crate) struct Guarded<T> {
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Guarded<T> {}
unsafe impl<T: Send> Sync for Guarded<T> {}

impl<T> Guarded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// # Safety
    ///
    /// The caller holds the guarding lock for the whole call, and `f` does
    /// not block on a condition of that lock.
    pub(crate) unsafe fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut *self.value.get())
    }

    pub(crate) fn into_inner(self) -> T {
        self.value.into_inner()
    }
}
