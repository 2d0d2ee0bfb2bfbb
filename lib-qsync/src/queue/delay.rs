use std::{cmp::Reverse, collections::BinaryHeap, fmt, time::Duration};

use quanta::Instant;

use super::{notify, wait_until, BlockingQueue, OfferError};
use crate::{
    deadline::Deadline,
    error::SyncError,
    guarded::Guarded,
    locks::{Condition, ReentrantLock},
    thread::{self, ThreadId},
};

/// An element that becomes available only once its delay has expired.
/// The ordering must agree with the expiry order.
pub trait Delayed: Ord {
    fn remaining_delay(&self) -> Duration;
}

// About a century, still far from overflowing the clock.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The instant `delay` from now, clamped for absurdly long delays.
pub(crate) fn expiry_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now)
}

/// Wraps a value with a fixed expiry time.
#[derive(Debug, Clone)]
pub struct DelayedItem<T> {
    pub value: T,
    expires_at: Instant,
}

impl<T> DelayedItem<T> {
    pub fn new(value: T, delay: Duration) -> Self {
        Self {
            value,
            expires_at: expiry_after(delay),
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> PartialEq for DelayedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}

impl<T> Eq for DelayedItem<T> {}

impl<T> PartialOrd for DelayedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DelayedItem<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expires_at.cmp(&other.expires_at)
    }
}

impl<T> Delayed for DelayedItem<T> {
    fn remaining_delay(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

struct DelayState<T> {
    heap: BinaryHeap<Reverse<T>>,
    // The thread timing the head, others wait without a deadline.
    leader: Option<ThreadId>,
}

/// Unbounded queue of [`Delayed`] elements, released in expiry order once
/// expired.
pub struct DelayQueue<T> {
    lock: ReentrantLock,
    available: Condition,
    state: Guarded<DelayState<T>>,
}

impl<T: Delayed + Send> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Delayed + Send> DelayQueue<T> {
    pub fn new() -> Self {
        let lock = ReentrantLock::new();
        let available = lock.new_condition();
        Self {
            lock,
            available,
            state: Guarded::new(DelayState {
                heap: BinaryHeap::new(),
                leader: None,
            }),
        }
    }

    /// Head of the queue, expired or not.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let _guard = self.lock.lock_guard();
        self.locked(|state| state.heap.peek().map(|Reverse(head)| head.clone()))
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
        let _guard = self.lock.lock_guard();
        self.locked(|state| {
            let mut items = state
                .heap
                .iter()
                .map(|Reverse(item)| item.clone())
                .collect::<Vec<_>>();
            items.sort();
            items
        })
    }

    pub fn clear(&self) {
        let _guard = self.lock.lock_guard();
        self.locked(|state| state.heap.clear());
    }

    fn locked<R>(&self, f: impl FnOnce(&mut DelayState<T>) -> R) -> R {
        debug_assert!(self.lock.is_held_by_current_thread());
        unsafe { self.state.with(f) }
    }

    fn head_delay(&self) -> Option<Duration> {
        self.locked(|state| state.heap.peek().map(|Reverse(head)| head.remaining_delay()))
    }

    fn pop_expired(&self) -> Option<T> {
        self.locked(|state| match state.heap.peek() {
            Some(Reverse(head)) if head.remaining_delay().is_zero() => {
                state.heap.pop().map(|Reverse(head)| head)
            }
            _ => None,
        })
    }

    fn leader(&self) -> Option<ThreadId> {
        self.locked(|state| state.leader)
    }

    fn set_leader(&self, leader: Option<ThreadId>) {
        self.locked(|state| state.leader = leader);
    }

    fn wait_for_expiry(&self, deadline: Deadline) -> Result<Option<T>, SyncError> {
        let _guard = self.lock.lock_guard_interruptibly()?;
        let result = self.wait_for_expiry_locked(deadline);

        if self.leader().is_none() && self.head_delay().is_some() {
            notify(&self.available);
        }
        result
    }

    fn wait_for_expiry_locked(&self, deadline: Deadline) -> Result<Option<T>, SyncError> {
        loop {
            let delay = match self.head_delay() {
                Some(delay) if delay.is_zero() => return Ok(self.pop_expired()),
                Some(delay) => delay,
                None => {
                    if !wait_until(&self.available, deadline)? {
                        return Ok(None);
                    }
                    continue;
                }
            };

            if deadline.has_elapsed() {
                return Ok(None);
            }

            let bounded = deadline
                .remaining()
                .map_or(false, |left| left < delay);

            if bounded || self.leader().is_some() {
                if !wait_until(&self.available, deadline)? {
                    return Ok(None);
                }
                continue;
            }

            let me = thread::current_id();
            self.set_leader(Some(me));
            let waited = self.available.wait_for(delay);
            if self.leader() == Some(me) {
                self.set_leader(None);
            }
            waited?;
        }
    }
}

impl<T: Delayed + Send> BlockingQueue<T> for DelayQueue<T> {
    fn offer(&self, item: T) -> Result<(), OfferError<T>> {
        let _guard = self.lock.lock_guard();
        let becomes_head = self.locked(|state| {
            let becomes_head = state.heap.peek().map_or(true, |Reverse(head)| item <= *head);
            state.heap.push(Reverse(item));
            becomes_head
        });

        if becomes_head {
            self.set_leader(None);
            notify(&self.available);
        }
        Ok(())
    }

    fn offer_timeout(&self, item: T, _: Duration) -> Result<(), OfferError<T>> {
        self.offer(item)
    }

    fn put(&self, item: T) -> Result<(), OfferError<T>> {
        self.offer(item)
    }

    /// Returns the head only if it has expired.
    fn poll(&self) -> Option<T> {
        let _guard = self.lock.lock_guard();
        self.pop_expired()
    }

    fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>, SyncError> {
        self.wait_for_expiry(Deadline::after(timeout))
    }

    fn take(&self) -> Result<T, SyncError> {
        self.wait_for_expiry(Deadline::never())?
            .ok_or(SyncError::IllegalState("unbounded take returned nothing"))
    }

    /// Counts expired and unexpired elements alike.
    fn len(&self) -> usize {
        let _guard = self.lock.lock_guard();
        self.locked(|state| state.heap.len())
    }

    fn remaining_capacity(&self) -> usize {
        usize::MAX
    }

    /// Moves only expired elements.
    fn drain_to_max(&self, sink: &mut Vec<T>, max: usize) -> usize {
        let _guard = self.lock.lock_guard();
        let mut drained = 0;
        while drained < max {
            match self.pop_expired() {
                Some(item) => sink.push(item),
                None => break,
            }
            drained += 1;
        }
        drained
    }

    fn remove_where(&self, pred: &mut dyn FnMut(&T) -> bool) -> Vec<T> {
        let _guard = self.lock.lock_guard();
        self.locked(|state| {
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.heap)
                .into_vec()
                .into_iter()
                .partition(|Reverse(item)| pred(item));
            state.heap = kept.into();
            let mut removed = removed.into_iter().map(|Reverse(item)| item).collect::<Vec<_>>();
            removed.sort();
            removed
        })
    }
}

impl<T> fmt::Debug for DelayQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        testing::{MEDIUM_DELAY, SHORT_DELAY},
        thread::spawn,
    };

    use super::*;

    #[test]
    fn unexpired_elements_are_held_back() {
        let queue = DelayQueue::new();
        queue.offer(DelayedItem::new("late", MEDIUM_DELAY)).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue.poll().is_none());
        assert_eq!(queue.drain_to(&mut Vec::new()), 0);
        assert!(queue.poll_timeout(SHORT_DELAY).unwrap().is_none());

        let item = queue.take().unwrap();
        assert_eq!(item.value, "late");
        assert!(item.remaining_delay().is_zero());
        assert!(queue.is_empty());
    }

    #[test]
    fn expired_elements_leave_in_expiry_order() {
        let queue = DelayQueue::new();
        queue.offer(DelayedItem::new(2, Duration::from_millis(20))).unwrap();
        queue.offer(DelayedItem::new(1, Duration::ZERO)).unwrap();
        queue.offer(DelayedItem::new(3, Duration::from_millis(40))).unwrap();
        assert_eq!(queue.peek().map(|item| item.value), Some(1));

        std::thread::sleep(SHORT_DELAY);
        let mut sink = Vec::new();
        assert_eq!(queue.drain_to(&mut sink), 3);
        assert_eq!(sink.into_iter().map(DelayedItem::into_inner).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn earlier_offer_wakes_leader() {
        let queue = Arc::new(DelayQueue::new());
        queue.offer(DelayedItem::new(1, Duration::from_secs(60))).unwrap();

        let other = queue.clone();
        let consumer = spawn(move || other.take().map(DelayedItem::into_inner));
        std::thread::sleep(SHORT_DELAY);

        queue.offer(DelayedItem::new(2, Duration::ZERO)).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_where_keeps_the_rest() {
        let queue = DelayQueue::new();
        for i in 0..4 {
            queue.offer(DelayedItem::new(i, Duration::from_secs(i as u64))).unwrap();
        }
        let removed = queue.remove_where(&mut |item| item.value % 2 == 1);
        assert_eq!(removed.into_iter().map(|item| item.value).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(
            queue.snapshot().into_iter().map(|item| item.value).collect::<Vec<_>>(),
            vec![0, 2]
        );
    }

    #[test]
    fn interrupted_take_fails() {
        let queue = Arc::new(DelayQueue::<DelayedItem<()>>::new());
        let other = queue.clone();
        let consumer = spawn(move || other.take().map(drop));
        consumer.interrupt();
        assert_eq!(consumer.join().unwrap(), Err(SyncError::Interrupted));
    }
}
