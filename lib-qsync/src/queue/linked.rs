use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering::*},
    time::Duration,
};

use crossbeam::queue::SegQueue;

use super::{notify, notify_all, wait_until, BlockingQueue, OfferError};
use crate::{
    deadline::Deadline,
    error::SyncError,
    locks::{Condition, ReentrantLock, ReentrantLockGuard},
};

/// Optionally bounded queue with separate locks for producers and
/// consumers, so a put and a take never contend with each other. Elements
/// live in a lock-free segment queue; the locks only order the waiting.
///
/// Lock order is put lock, then take lock.
pub struct LinkedBlockingQueue<T> {
    capacity: usize,
    count: AtomicUsize,
    items: SegQueue<T>,
    take_lock: ReentrantLock,
    not_empty: Condition,
    put_lock: ReentrantLock,
    not_full: Condition,
}

impl<T: Send> Default for LinkedBlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> LinkedBlockingQueue<T> {
    pub fn new() -> Self {
        Self::build(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, SyncError> {
        if capacity == 0 {
            return Err(SyncError::IllegalArgument("capacity must be positive"));
        }
        Ok(Self::build(capacity))
    }

    fn build(capacity: usize) -> Self {
        let take_lock = ReentrantLock::new();
        let not_empty = take_lock.new_condition();
        let put_lock = ReentrantLock::new();
        let not_full = put_lock.new_condition();

        Self {
            capacity,
            count: AtomicUsize::new(0),
            items: SegQueue::new(),
            take_lock,
            not_empty,
            put_lock,
            not_full,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.snapshot().into_iter().next()
    }

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
        let _guards = self.fully_lock();
        let items = self.pop_all();
        let copy = items.clone();
        self.push_all(items);
        copy
    }

    pub fn contains(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let _guards = self.fully_lock();
        let items = self.pop_all();
        let found = items.iter().any(|queued| queued == item);
        self.push_all(items);
        found
    }

    pub fn clear(&self) {
        self.remove_where(&mut |_| true);
    }

    fn fully_lock(&self) -> (ReentrantLockGuard<'_>, ReentrantLockGuard<'_>) {
        let put = self.put_lock.lock_guard();
        let take = self.take_lock.lock_guard();
        (put, take)
    }

    fn pop_all(&self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.items.len());
        while let Some(item) = self.items.pop() {
            items.push(item);
        }
        items
    }

    fn push_all(&self, items: Vec<T>) {
        for item in items {
            self.items.push(item);
        }
    }

    fn signal_not_empty(&self) {
        let _guard = self.take_lock.lock_guard();
        notify(&self.not_empty);
    }

    fn signal_not_full(&self) {
        let _guard = self.put_lock.lock_guard();
        notify(&self.not_full);
    }

    /// Appends under the put lock, returning the count before the insert.
    fn enqueue(&self, item: T) -> usize {
        self.items.push(item);
        let c = self.count.fetch_add(1, AcqRel);
        if c + 1 < self.capacity {
            notify(&self.not_full);
        }
        c
    }

    /// Removes the head under the take lock, returning it with the count
    /// before the removal. The caller has seen a nonzero count.
    fn dequeue(&self) -> Result<(T, usize), SyncError> {
        let item = self
            .items
            .pop()
            .ok_or(SyncError::IllegalState("element count out of sync"))?;
        let c = self.count.fetch_sub(1, AcqRel);
        if c > 1 {
            notify(&self.not_empty);
        }
        Ok((item, c))
    }

    fn is_full(&self) -> bool {
        self.count.load(Acquire) == self.capacity
    }

    fn is_drained(&self) -> bool {
        self.count.load(Acquire) == 0
    }

    fn put_inner(&self, item: T, deadline: Deadline) -> Result<(), OfferError<T>> {
        let c = {
            let _guard = match self.put_lock.lock_guard_interruptibly() {
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
            self.enqueue(item)
        };

        if c == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    fn take_inner(&self, deadline: Deadline) -> Result<Option<T>, SyncError> {
        let (item, c) = {
            let _guard = self.take_lock.lock_guard_interruptibly()?;
            while self.is_drained() {
                if !wait_until(&self.not_empty, deadline)? {
                    return Ok(None);
                }
            }
            self.dequeue()?
        };

        if c == self.capacity {
            self.signal_not_full();
        }
        Ok(Some(item))
    }
}

impl<T: Send> BlockingQueue<T> for LinkedBlockingQueue<T> {
    fn offer(&self, item: T) -> Result<(), OfferError<T>> {
        if self.is_full() {
            return Err(OfferError::Full(item));
        }

        let c = {
            let _guard = self.put_lock.lock_guard();
            if self.is_full() {
                return Err(OfferError::Full(item));
            }
            self.enqueue(item)
        };

        if c == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), OfferError<T>> {
        self.put_inner(item, Deadline::after(timeout))
    }

    fn put(&self, item: T) -> Result<(), OfferError<T>> {
        self.put_inner(item, Deadline::never())
    }

    fn poll(&self) -> Option<T> {
        if self.is_drained() {
            return None;
        }

        let (item, c) = {
            let _guard = self.take_lock.lock_guard();
            if self.is_drained() {
                return None;
            }
            self.dequeue().ok()?
        };

        if c == self.capacity {
            self.signal_not_full();
        }
        Some(item)
    }

    fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>, SyncError> {
        self.take_inner(Deadline::after(timeout))
    }

    fn take(&self) -> Result<T, SyncError> {
        self.take_inner(Deadline::never())?
            .ok_or(SyncError::IllegalState("unbounded take returned nothing"))
    }

    fn len(&self) -> usize {
        self.count.load(Acquire)
    }

    fn remaining_capacity(&self) -> usize {
        self.capacity - self.count.load(Acquire)
    }

    fn drain_to_max(&self, sink: &mut Vec<T>, max: usize) -> usize {
        let (drained, before) = {
            let _guard = self.take_lock.lock_guard();
            let n = max.min(self.count.load(Acquire));
            let mut drained = 0;
            while drained < n {
                match self.items.pop() {
                    Some(item) => sink.push(item),
                    None => break,
                }
                drained += 1;
            }
            (drained, self.count.fetch_sub(drained, AcqRel))
        };

        if drained > 0 && before == self.capacity {
            self.signal_not_full();
        }
        drained
    }

    fn remove_where(&self, pred: &mut dyn FnMut(&T) -> bool) -> Vec<T> {
        let _guards = self.fully_lock();
        let (removed, kept): (Vec<T>, Vec<T>) = self.pop_all().into_iter().partition(|item| pred(item));
        self.push_all(kept);

        if !removed.is_empty() {
            let before = self.count.fetch_sub(removed.len(), AcqRel);
            if before == self.capacity {
                notify_all(&self.not_full);
            }
        }
        removed
    }
}

impl<T> fmt::Debug for LinkedBlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedBlockingQueue")
            .field("len", &self.count.load(Acquire))
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        testing::{LONG_DELAY, SHORT_DELAY},
        thread::spawn,
    };

    use super::*;

    #[test]
    fn bounded_fifo() {
        let queue = LinkedBlockingQueue::with_capacity(2).unwrap();
        queue.offer(1).unwrap();
        queue.offer(2).unwrap();
        assert!(queue.offer(3).unwrap_err().is_full());
        assert_eq!(queue.remaining_capacity(), 0);
        assert_eq!(queue.snapshot(), vec![1, 2]);
        assert_eq!(queue.peek(), Some(1));
        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn unbounded_reports_max_capacity() {
        let queue = LinkedBlockingQueue::new();
        queue.offer("a").unwrap();
        assert_eq!(queue.remaining_capacity(), usize::MAX - 1);
        assert!(matches!(
            LinkedBlockingQueue::<u8>::with_capacity(0),
            Err(SyncError::IllegalArgument(_))
        ));
    }

    #[test]
    fn remove_and_drain() {
        let queue = LinkedBlockingQueue::with_capacity(5).unwrap();
        for i in 0..5 {
            queue.put(i).unwrap();
        }
        assert_eq!(queue.remove_where(&mut |x| x % 2 == 0), vec![0, 2, 4]);
        assert!(queue.contains(&3));
        assert!(!queue.contains(&4));

        let mut sink = Vec::new();
        assert_eq!(queue.drain_to(&mut sink), 2);
        assert_eq!(sink, vec![1, 3]);
        assert!(queue.is_empty());
        queue.offer(9).unwrap();
        queue.clear();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn put_waits_for_space() {
        let queue = Arc::new(LinkedBlockingQueue::with_capacity(1).unwrap());
        queue.put(1).unwrap();
        assert_eq!(queue.offer_timeout(2, SHORT_DELAY), Err(OfferError::Timeout(2)));

        let other = queue.clone();
        let producer = spawn(move || other.put(2));
        std::thread::sleep(SHORT_DELAY);
        assert_eq!(queue.take(), Ok(1));
        assert_eq!(producer.join().unwrap(), Ok(()));
        assert_eq!(queue.poll_timeout(LONG_DELAY), Ok(Some(2)));
    }

    #[test]
    fn take_waits_for_element() {
        let queue = Arc::new(LinkedBlockingQueue::new());
        assert_eq!(queue.poll_timeout(SHORT_DELAY), Ok(None));

        let other = queue.clone();
        let consumer = spawn(move || other.take());
        std::thread::sleep(SHORT_DELAY);
        queue.put(5).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(5));
    }

    #[test]
    fn interrupted_take_fails() {
        let queue = Arc::new(LinkedBlockingQueue::<i32>::new());
        let other = queue.clone();
        let consumer = spawn(move || other.take());
        consumer.interrupt();
        assert_eq!(consumer.join().unwrap(), Err(SyncError::Interrupted));
    }

    #[test]
    fn many_producers_and_consumers() {
        let queue = Arc::new(LinkedBlockingQueue::with_capacity(4).unwrap());
        let producers = (0..4)
            .map(|p| {
                let queue = queue.clone();
                spawn(move || {
                    for i in 0..250 {
                        queue.put(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        let consumers = (0..4)
            .map(|_| {
                let queue = queue.clone();
                spawn(move || (0..250).map(|_| queue.take().unwrap()).sum::<usize>())
            })
            .collect::<Vec<_>>();

        for producer in producers {
            producer.join().unwrap();
        }
        let total: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        let expected: usize = (0..4).map(|p| (0..250).map(|i| p * 1000 + i).sum::<usize>()).sum();
        assert_eq!(total, expected);
        assert!(queue.is_empty());
    }
}
