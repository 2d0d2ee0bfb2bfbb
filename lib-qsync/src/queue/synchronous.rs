use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    time::Duration,
};

use super::{notify_all, wait_until, BlockingQueue, OfferError};
use crate::{
    deadline::Deadline,
    error::SyncError,
    guarded::Guarded,
    locks::{Condition, ReentrantLock, ReentrantLockGuard},
    thread,
};

type Ticket = u64;

struct Exchange<T> {
    producers: VecDeque<(Ticket, T)>,
    consumers: VecDeque<Ticket>,
    delivered: HashMap<Ticket, T>,
    taken: HashSet<Ticket>,
    next_ticket: Ticket,
}

impl<T> Exchange<T> {
    fn ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn pop_producer(&mut self, fair: bool) -> Option<(Ticket, T)> {
        if fair {
            self.producers.pop_front()
        } else {
            self.producers.pop_back()
        }
    }

    fn pop_consumer(&mut self, fair: bool) -> Option<Ticket> {
        if fair {
            self.consumers.pop_front()
        } else {
            self.consumers.pop_back()
        }
    }

    fn withdraw_producer(&mut self, ticket: Ticket) -> Option<T> {
        let index = self.producers.iter().position(|(queued, _)| *queued == ticket)?;
        self.producers.remove(index).map(|(_, item)| item)
    }

    fn withdraw_consumer(&mut self, ticket: Ticket) {
        self.consumers.retain(|queued| *queued != ticket);
    }
}

/// A queue without capacity: every insert waits for a matching removal
/// and vice versa. Fair mode matches waiters in arrival order, unfair mode
/// serves the most recent waiter first.
pub struct SynchronousQueue<T> {
    fair: bool,
    lock: ReentrantLock,
    changed: Condition,
    exchange: Guarded<Exchange<T>>,
}

impl<T: Send> Default for SynchronousQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> SynchronousQueue<T> {
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    pub fn with_fairness(fair: bool) -> Self {
        let lock = ReentrantLock::with_fairness(fair);
        let changed = lock.new_condition();
        Self {
            fair,
            lock,
            changed,
            exchange: Guarded::new(Exchange {
                producers: VecDeque::new(),
                consumers: VecDeque::new(),
                delivered: HashMap::new(),
                taken: HashSet::new(),
                next_ticket: 0,
            }),
        }
    }

    pub fn is_fair(&self) -> bool {
        self.fair
    }

    pub fn has_waiting_consumer(&self) -> bool {
        let _guard = self.lock.lock_guard();
        self.locked(|exchange| !exchange.consumers.is_empty())
    }

    pub fn has_waiting_producer(&self) -> bool {
        let _guard = self.lock.lock_guard();
        self.locked(|exchange| !exchange.producers.is_empty())
    }

    fn locked<R>(&self, f: impl FnOnce(&mut Exchange<T>) -> R) -> R {
        debug_assert!(self.lock.is_held_by_current_thread());
        unsafe { self.exchange.with(f) }
    }

    fn guard(&self, interruptible: bool) -> Result<ReentrantLockGuard<'_>, SyncError> {
        if interruptible {
            self.lock.lock_guard_interruptibly()
        } else {
            Ok(self.lock.lock_guard())
        }
    }

    /// `deadline` of `None` means do not wait at all.
    fn hand_off(&self, item: T, deadline: Option<Deadline>) -> Result<(), OfferError<T>> {
        let _guard = match self.guard(deadline.is_some()) {
            Ok(guard) => guard,
            Err(_) => return Err(OfferError::Interrupted(item)),
        };

        if let Some(consumer) = self.locked(|exchange| exchange.pop_consumer(self.fair)) {
            self.locked(|exchange| exchange.delivered.insert(consumer, item));
            notify_all(&self.changed);
            return Ok(());
        }

        let deadline = match deadline {
            Some(deadline) if !deadline.has_elapsed() => deadline,
            Some(_) => return Err(OfferError::Timeout(item)),
            None => return Err(OfferError::Full(item)),
        };

        let ticket = self.locked(|exchange| {
            let ticket = exchange.ticket();
            exchange.producers.push_back((ticket, item));
            ticket
        });

        loop {
            let waited = wait_until(&self.changed, deadline);

            if self.locked(|exchange| exchange.taken.remove(&ticket)) {
                if waited.is_err() {
                    thread::interrupt_current();
                }
                return Ok(());
            }

            match waited {
                Ok(true) => continue,
                Ok(false) => {
                    return match self.locked(|exchange| exchange.withdraw_producer(ticket)) {
                        Some(item) => Err(OfferError::Timeout(item)),
                        None => Ok(()),
                    }
                }
                Err(_) => {
                    return match self.locked(|exchange| exchange.withdraw_producer(ticket)) {
                        Some(item) => Err(OfferError::Interrupted(item)),
                        None => Ok(()),
                    }
                }
            }
        }
    }

    fn receive(&self, deadline: Option<Deadline>) -> Result<Option<T>, SyncError> {
        let _guard = self.guard(deadline.is_some())?;

        if let Some((producer, item)) = self.locked(|exchange| exchange.pop_producer(self.fair)) {
            self.locked(|exchange| exchange.taken.insert(producer));
            notify_all(&self.changed);
            return Ok(Some(item));
        }

        let deadline = match deadline {
            Some(deadline) if !deadline.has_elapsed() => deadline,
            _ => return Ok(None),
        };

        let ticket = self.locked(|exchange| {
            let ticket = exchange.ticket();
            exchange.consumers.push_back(ticket);
            ticket
        });

        loop {
            let waited = wait_until(&self.changed, deadline);

            if let Some(item) = self.locked(|exchange| exchange.delivered.remove(&ticket)) {
                if waited.is_err() {
                    thread::interrupt_current();
                }
                return Ok(Some(item));
            }

            match waited {
                Ok(true) => continue,
                Ok(false) => {
                    self.locked(|exchange| exchange.withdraw_consumer(ticket));
                    return Ok(None);
                }
                Err(err) => {
                    self.locked(|exchange| exchange.withdraw_consumer(ticket));
                    return Err(err);
                }
            }
        }
    }
}

impl<T: Send> BlockingQueue<T> for SynchronousQueue<T> {
    /// Succeeds only if a consumer is already waiting.
    fn offer(&self, item: T) -> Result<(), OfferError<T>> {
        self.hand_off(item, None)
    }

    fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), OfferError<T>> {
        self.hand_off(item, Some(Deadline::after(timeout)))
    }

    fn put(&self, item: T) -> Result<(), OfferError<T>> {
        self.hand_off(item, Some(Deadline::never()))
    }

    /// Succeeds only if a producer is already waiting.
    fn poll(&self) -> Option<T> {
        self.receive(None).ok().flatten()
    }

    fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>, SyncError> {
        self.receive(Some(Deadline::after(timeout)))
    }

    fn take(&self) -> Result<T, SyncError> {
        self.receive(Some(Deadline::never()))?
            .ok_or(SyncError::IllegalState("unbounded take returned nothing"))
    }

    fn len(&self) -> usize {
        0
    }

    fn remaining_capacity(&self) -> usize {
        0
    }

    /// Takes from producers that are already waiting.
    fn drain_to_max(&self, sink: &mut Vec<T>, max: usize) -> usize {
        let _guard = self.lock.lock_guard();
        let mut drained = 0;
        while drained < max {
            match self.locked(|exchange| exchange.pop_producer(self.fair)) {
                Some((producer, item)) => {
                    self.locked(|exchange| exchange.taken.insert(producer));
                    sink.push(item);
                }
                None => break,
            }
            drained += 1;
        }
        if drained > 0 {
            notify_all(&self.changed);
        }
        drained
    }

    /// Elements in transit are never visible, so nothing is removed.
    fn remove_where(&self, _: &mut dyn FnMut(&T) -> bool) -> Vec<T> {
        Vec::new()
    }
}

impl<T> fmt::Debug for SynchronousQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronousQueue")
            .field("fair", &self.fair)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        testing::{await_until, SHORT_DELAY},
        thread::spawn,
    };

    use super::*;

    #[test]
    fn no_capacity_without_partner() {
        let queue = SynchronousQueue::new();
        assert_eq!(queue.offer(1), Err(OfferError::Full(1)));
        assert_eq!(queue.poll(), None);
        assert_eq!(queue.offer_timeout(1, SHORT_DELAY), Err(OfferError::Timeout(1)));
        assert_eq!(queue.poll_timeout(SHORT_DELAY), Ok(None));
        assert!(queue.is_empty());
        assert_eq!(queue.remaining_capacity(), 0);
        assert!(!queue.has_waiting_producer());
    }

    #[test]
    fn put_meets_take() {
        let queue = Arc::new(SynchronousQueue::with_fairness(true));
        let other = queue.clone();
        let producer = spawn(move || other.put(42));

        await_until("producer to wait", || queue.has_waiting_producer());
        assert_eq!(queue.take(), Ok(42));
        assert_eq!(producer.join().unwrap(), Ok(()));
    }

    #[test]
    fn offer_succeeds_with_waiting_consumer() {
        let queue = Arc::new(SynchronousQueue::new());
        let other = queue.clone();
        let consumer = spawn(move || other.take());

        await_until("consumer to wait", || queue.has_waiting_consumer());
        assert_eq!(queue.offer(7), Ok(()));
        assert_eq!(consumer.join().unwrap(), Ok(7));
    }

    #[test]
    fn fair_mode_matches_in_arrival_order() {
        let queue = Arc::new(SynchronousQueue::with_fairness(true));
        let mut producers = Vec::new();
        for i in 0..3 {
            let other = queue.clone();
            producers.push(spawn(move || other.put(i)));
            await_until("producer to wait", || {
                let _guard = queue.lock.lock_guard();
                queue.locked(|exchange| exchange.producers.len() == i + 1)
            });
        }

        let mut sink = Vec::new();
        assert_eq!(queue.drain_to(&mut sink), 3);
        assert_eq!(sink, vec![0, 1, 2]);
        for producer in producers {
            assert_eq!(producer.join().unwrap(), Ok(()));
        }
    }

    #[test]
    fn unfair_mode_serves_latest_first() {
        let queue = Arc::new(SynchronousQueue::new());
        let mut producers = Vec::new();
        for i in 0..2 {
            let other = queue.clone();
            producers.push(spawn(move || other.put(i)));
            await_until("producer to wait", || {
                let _guard = queue.lock.lock_guard();
                queue.locked(|exchange| exchange.producers.len() == i + 1)
            });
        }

        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.poll(), Some(0));
        for producer in producers {
            producer.join().unwrap().unwrap();
        }
    }

    #[test]
    fn interrupted_put_returns_item() {
        let queue = Arc::new(SynchronousQueue::new());
        let other = queue.clone();
        let producer = spawn(move || other.put("x"));
        await_until("producer to wait", || queue.has_waiting_producer());
        producer.interrupt();

        assert_eq!(producer.join().unwrap(), Err(OfferError::Interrupted("x")));
        assert!(!queue.has_waiting_producer());
    }
}
