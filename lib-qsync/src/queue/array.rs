use std::{fmt, time::Duration};

use super::{notify, notify_all, wait_until, BlockingQueue, OfferError};
use crate::{
    deadline::Deadline,
    error::SyncError,
    guarded::Guarded,
    locks::{Condition, ReentrantLock},
};

struct Ring<T> {
    items: Box<[Option<T>]>,
    take_index: usize,
    put_index: usize,
    count: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: (0..capacity).map(|_| None).collect(),
            take_index: 0,
            put_index: 0,
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.items.len()
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    fn inc(&self, index: usize) -> usize {
        if index + 1 == self.capacity() {
            0
        } else {
            index + 1
        }
    }

    fn push(&mut self, item: T) {
        self.items[self.put_index] = Some(item);
        self.put_index = self.inc(self.put_index);
        self.count += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = self.items[self.take_index].take();
        self.take_index = self.inc(self.take_index);
        self.count -= 1;
        item
    }

    fn peek(&self) -> Option<&T> {
        if self.count == 0 {
            return None;
        }
        self.items[self.take_index].as_ref()
    }

    fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.count)
            .filter_map(move |i| self.items[(self.take_index + i) % self.capacity()].as_ref())
    }

    fn remove_where(&mut self, pred: &mut dyn FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.count);
        while let Some(item) = self.pop() {
            if pred(&item) {
                removed.push(item);
            } else {
                kept.push(item);
            }
        }
        for item in kept {
            self.push(item);
        }
        removed
    }
}

/// Bounded queue over a fixed ring buffer, guarded by one lock with
/// `not_empty` and `not_full` conditions.
pub struct ArrayBlockingQueue<T> {
    lock: ReentrantLock,
    not_empty: Condition,
    not_full: Condition,
    ring: Guarded<Ring<T>>,
}

impl<T: Send> ArrayBlockingQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, SyncError> {
        Self::with_fairness(capacity, false)
    }

    pub fn with_fairness(capacity: usize, fair: bool) -> Result<Self, SyncError> {
        if capacity == 0 {
            return Err(SyncError::IllegalArgument("capacity must be positive"));
        }
        let lock = ReentrantLock::with_fairness(fair);
        let not_empty = lock.new_condition();
        let not_full = lock.new_condition();

        Ok(Self {
            lock,
            not_empty,
            not_full,
            ring: Guarded::new(Ring::with_capacity(capacity)),
        })
    }

    pub fn from_items(
        capacity: usize,
        fair: bool,
        items: impl IntoIterator<Item = T>,
    ) -> Result<Self, SyncError> {
        let queue = Self::with_fairness(capacity, fair)?;
        for item in items {
            if queue.offer(item).is_err() {
                return Err(SyncError::IllegalArgument("more items than capacity"));
            }
        }
        Ok(queue)
    }

    pub fn capacity(&self) -> usize {
        let _guard = self.lock.lock_guard();
        self.locked(|ring| ring.capacity())
    }

    pub fn clear(&self) {
        let _guard = self.lock.lock_guard();
        let cleared = self.locked(|ring| {
            let mut cleared = 0;
            while ring.pop().is_some() {
                cleared += 1;
            }
            cleared
        });
        if cleared > 0 {
            notify_all(&self.not_full);
        }
    }

    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let _guard = self.lock.lock_guard();
        self.locked(|ring| ring.peek().cloned())
    }

    pub fn contains(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let _guard = self.lock.lock_guard();
        self.locked(|ring| ring.iter().any(|queued| queued == item))
    }

    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let mut found = false;
        let removed = self.remove_where(&mut |queued| {
            if !found && queued == item {
                found = true;
                return true;
            }
            false
        });
        !removed.is_empty()
    }

    /// Copies the elements in queue order.
    /// Iterates over a copy taken now. Later changes to the queue are not
    /// seen, and never disturb the iteration.
    pub fn iter(&self) -> std::vec::IntoIter<T>
    where
        T: Clone,
    {
        self.snapshot().into_iter()
    }

    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        let _guard = self.lock.lock_guard();
        self.locked(|ring| ring.iter().cloned().collect())
    }

    /// Runs `f` on the ring. Callers hold `self.lock`.
    fn locked<R>(&self, f: impl FnOnce(&mut Ring<T>) -> R) -> R {
        debug_assert!(self.lock.is_held_by_current_thread());
        unsafe { self.ring.with(f) }
    }

    fn enqueue(&self, item: T) {
        self.locked(|ring| ring.push(item));
        notify(&self.not_empty);
    }

    fn dequeue(&self) -> Option<T> {
        let item = self.locked(|ring| ring.pop());
        if item.is_some() {
            notify(&self.not_full);
        }
        item
    }

    fn is_full(&self) -> bool {
        self.locked(|ring| ring.is_full())
    }

    fn is_empty_locked(&self) -> bool {
        self.locked(|ring| ring.count == 0)
    }
}

impl<T: Send> BlockingQueue<T> for ArrayBlockingQueue<T> {
    fn offer(&self, item: T) -> Result<(), OfferError<T>> {
        let _guard = self.lock.lock_guard();
        if self.is_full() {
            return Err(OfferError::Full(item));
        }
        self.enqueue(item);
        Ok(())
    }

    fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), OfferError<T>> {
        let deadline = Deadline::after(timeout);
        let _guard = match self.lock.lock_guard_interruptibly() {
            Ok(guard) => guard,
            Err(_) => return Err(OfferError::Interrupted(item)),
        };

        while self.is_full() {
            match wait_until(&self.not_full, deadline) {
                Ok(true) => {}
                Ok(false) => return Err(OfferError::Timeout(item)),
                Err(_) => return Err(OfferError::Interrupted(item)),
            }
        }
        self.enqueue(item);
        Ok(())
    }

    fn put(&self, item: T) -> Result<(), OfferError<T>> {
        let _guard = match self.lock.lock_guard_interruptibly() {
            Ok(guard) => guard,
            Err(_) => return Err(OfferError::Interrupted(item)),
        };

        while self.is_full() {
            if self.not_full.wait().is_err() {
                return Err(OfferError::Interrupted(item));
            }
        }
        self.enqueue(item);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        let _guard = self.lock.lock_guard();
        self.dequeue()
    }

    fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>, SyncError> {
        let deadline = Deadline::after(timeout);
        let _guard = self.lock.lock_guard_interruptibly()?;

        while self.is_empty_locked() {
            if !wait_until(&self.not_empty, deadline)? {
                return Ok(None);
            }
        }
        Ok(self.dequeue())
    }

    fn take(&self) -> Result<T, SyncError> {
        let _guard = self.lock.lock_guard_interruptibly()?;

        loop {
            if let Some(item) = self.dequeue() {
                return Ok(item);
            }
            self.not_empty.wait()?;
        }
    }

    fn len(&self) -> usize {
        let _guard = self.lock.lock_guard();
        self.locked(|ring| ring.count)
    }

    fn remaining_capacity(&self) -> usize {
        let _guard = self.lock.lock_guard();
        self.locked(|ring| ring.capacity() - ring.count)
    }

    fn drain_to_max(&self, sink: &mut Vec<T>, max: usize) -> usize {
        let _guard = self.lock.lock_guard();
        let drained = self.locked(|ring| {
            let n = max.min(ring.count);
            sink.extend((0..n).filter_map(|_| ring.pop()));
            n
        });
        if drained > 0 {
            notify_all(&self.not_full);
        }
        drained
    }

    fn remove_where(&self, pred: &mut dyn FnMut(&T) -> bool) -> Vec<T> {
        let _guard = self.lock.lock_guard();
        let removed = self.locked(|ring| ring.remove_where(pred));
        if !removed.is_empty() {
            notify_all(&self.not_full);
        }
        removed
    }
}

impl<T: Send + fmt::Debug> fmt::Debug for ArrayBlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _guard = self.lock.lock_guard();
        self.locked(|ring| f.debug_list().entries(ring.iter()).finish())
    }
}
