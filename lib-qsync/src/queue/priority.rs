use std::{cmp::Reverse, collections::BinaryHeap, fmt, time::Duration};

use super::{notify, wait_until, BlockingQueue, OfferError};
use crate::{
    deadline::Deadline,
    error::SyncError,
    guarded::Guarded,
    locks::{Condition, ReentrantLock},
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry<T> {
    item: T,
    seq: u64,
}

struct Heap<T> {
    entries: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

impl<T: Ord> Heap<T> {
    fn push(&mut self, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Reverse(Entry { item, seq }));
    }

    fn pop(&mut self) -> Option<T> {
        self.entries.pop().map(|Reverse(entry)| entry.item)
    }

    fn sorted(&self) -> Vec<&T> {
        let mut items = self.entries.iter().map(|Reverse(entry)| entry).collect::<Vec<_>>();
        items.sort();
        items.into_iter().map(|entry| &entry.item).collect()
    }
}

/// Unbounded queue handing out the least element first. Elements that
/// compare equal leave in insertion order.
pub struct PriorityBlockingQueue<T> {
    lock: ReentrantLock,
    not_empty: Condition,
    heap: Guarded<Heap<T>>,
}

impl<T: Ord + Send> Default for PriorityBlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Send> PriorityBlockingQueue<T> {
    pub fn new() -> Self {
        let lock = ReentrantLock::new();
        let not_empty = lock.new_condition();
        Self {
            lock,
            not_empty,
            heap: Guarded::new(Heap {
                entries: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn with_capacity(initial: usize) -> Result<Self, SyncError> {
        if initial == 0 {
            return Err(SyncError::IllegalArgument("initial capacity must be positive"));
        }
        let queue = Self::new();
        unsafe { queue.heap.with(|heap| heap.entries.reserve(initial)) };
        Ok(queue)
    }

    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let _guard = self.lock.lock_guard();
        self.locked(|heap| heap.entries.peek().map(|Reverse(entry)| entry.item.clone()))
    }

    /// Copies the elements in priority order.
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
        self.locked(|heap| heap.sorted().into_iter().cloned().collect())
    }

    pub fn contains(&self, item: &T) -> bool {
        let _guard = self.lock.lock_guard();
        self.locked(|heap| heap.entries.iter().any(|Reverse(entry)| entry.item == *item))
    }

    pub fn clear(&self) {
        let _guard = self.lock.lock_guard();
        self.locked(|heap| heap.entries.clear());
    }

    fn locked<R>(&self, f: impl FnOnce(&mut Heap<T>) -> R) -> R {
        debug_assert!(self.lock.is_held_by_current_thread());
        unsafe { self.heap.with(f) }
    }

    fn dequeue(&self) -> Option<T> {
        self.locked(|heap| heap.pop())
    }
}

impl<T: Ord + Send> BlockingQueue<T> for PriorityBlockingQueue<T> {
    fn offer(&self, item: T) -> Result<(), OfferError<T>> {
        let _guard = self.lock.lock_guard();
        self.locked(|heap| heap.push(item));
        notify(&self.not_empty);
        Ok(())
    }

    /// Never blocks, the queue is unbounded.
    fn offer_timeout(&self, item: T, _: Duration) -> Result<(), OfferError<T>> {
        self.offer(item)
    }

    fn put(&self, item: T) -> Result<(), OfferError<T>> {
        self.offer(item)
    }

    fn poll(&self) -> Option<T> {
        let _guard = self.lock.lock_guard();
        self.dequeue()
    }

    fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>, SyncError> {
        let deadline = Deadline::after(timeout);
        let _guard = self.lock.lock_guard_interruptibly()?;
        loop {
            if let Some(item) = self.dequeue() {
                return Ok(Some(item));
            }
            if !wait_until(&self.not_empty, deadline)? {
                return Ok(None);
            }
        }
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
        self.locked(|heap| heap.entries.len())
    }

    fn remaining_capacity(&self) -> usize {
        usize::MAX
    }

    fn drain_to_max(&self, sink: &mut Vec<T>, max: usize) -> usize {
        let _guard = self.lock.lock_guard();
        self.locked(|heap| {
            let mut drained = 0;
            while drained < max {
                match heap.pop() {
                    Some(item) => sink.push(item),
                    None => break,
                }
                drained += 1;
            }
            drained
        })
    }

    fn remove_where(&self, pred: &mut dyn FnMut(&T) -> bool) -> Vec<T> {
        let _guard = self.lock.lock_guard();
        self.locked(|heap| {
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut heap.entries)
                .into_vec()
                .into_iter()
                .partition(|Reverse(entry)| pred(&entry.item));
            heap.entries = kept.into();
            let mut removed = removed.into_iter().map(|Reverse(entry)| entry).collect::<Vec<_>>();
            removed.sort();
            removed.into_iter().map(|entry| entry.item).collect()
        })
    }
}

impl<T: Ord + Send + fmt::Debug> fmt::Debug for PriorityBlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _guard = self.lock.lock_guard();
        self.locked(|heap| f.debug_list().entries(heap.sorted()).finish())
    }
}
