use std::{
    sync::{
        atomic::{AtomicUsize, Ordering::*},
        Arc,
    },
    thread::available_parallelism,
    time::{Duration, Instant},
};

use serial_test::serial;

use crate::{
    barrier::CyclicBarrier,
    error::SyncError,
    executor::{ExecutorService, ThreadPoolBuilder, ThreadPoolExecutor},
    locks::{
        CountDownLatch, Lock, Mutex, QueuedMutex, ReentrantLock, ReentrantReadWriteLock, Semaphore,
    },
    queue::{
        ArrayBlockingQueue, BlockingQueue, DelayQueue, DelayedItem, LinkedBlockingQueue,
        PriorityBlockingQueue, SynchronousQueue,
    },
    testing::{await_until, LONG_DELAY, MEDIUM_DELAY, SHORT_DELAY},
    thread::spawn,
};

const THREAD_NUM: usize = 16;
const ITERATION: usize = 2000;

/// Counter wrapper whose only protection is the lock under test.
struct Unprotected(std::cell::UnsafeCell<usize>);

unsafe impl Sync for Unprotected {}

pub fn inner_test<L: Lock + Send + Sync + 'static>(lock: Arc<L>) {
    let counter = Arc::new(Unprotected(std::cell::UnsafeCell::new(0)));
    let mut handles = vec![];

    for _ in 0..THREAD_NUM {
        let lock = lock.clone();
        let counter = counter.clone();
        handles.push(spawn(move || {
            for _ in 0..ITERATION {
                lock.lock();
                unsafe { *counter.0.get() += 1 };
                lock.unlock().unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(lock.try_lock());
    assert_eq!(unsafe { *counter.0.get() }, THREAD_NUM * ITERATION);
    lock.unlock().unwrap();
}

#[test]
pub fn mutex_test() {
    inner_test(Arc::new(Mutex::new()));
}

#[test]
pub fn reentrant_test() {
    inner_test(Arc::new(ReentrantLock::new()));
}

#[test]
pub fn fair_reentrant_test() {
    inner_test(Arc::new(ReentrantLock::with_fairness(true)));
}

#[test]
pub fn write_lock_test() {
    let rw = Arc::new(ReentrantReadWriteLock::new());
    let counter = Arc::new(Unprotected(std::cell::UnsafeCell::new(0)));
    let handles = (0..THREAD_NUM)
        .map(|_| {
            let rw = rw.clone();
            let counter = counter.clone();
            spawn(move || {
                for _ in 0..ITERATION {
                    rw.write_lock().lock();
                    unsafe { *counter.0.get() += 1 };
                    rw.write_lock().unlock().unwrap();

                    rw.read_lock().lock();
                    assert!(unsafe { *counter.0.get() } > 0);
                    rw.read_lock().unlock().unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(unsafe { *counter.0.get() }, THREAD_NUM * ITERATION);
    assert!(!rw.is_write_locked());
    assert_eq!(rw.read_lock_count(), 0);
}

#[test]
pub fn queued_mutex_guards_data() {
    let cpu_count = available_parallelism().map(|n| n.get()).unwrap_or(4);
    let data = Arc::new(QueuedMutex::new(0usize));
    let handles = (0..cpu_count)
        .map(|_| {
            let data = data.clone();
            spawn(move || {
                for _ in 0..ITERATION {
                    *data.lock() += 1;
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*data.lock(), cpu_count * ITERATION);
}

#[test]
pub fn semaphore_as_lock() {
    let permits = Arc::new(Semaphore::new(1));
    let inside = Arc::new(AtomicUsize::new(0));
    let handles = (0..THREAD_NUM)
        .map(|_| {
            let permits = permits.clone();
            let inside = inside.clone();
            spawn(move || {
                for _ in 0..ITERATION / 10 {
                    permits.acquire().unwrap();
                    assert_eq!(inside.fetch_add(1, SeqCst), 0);
                    inside.fetch_sub(1, SeqCst);
                    permits.release().unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(permits.available_permits(), 1);
}

#[test]
#[serial]
pub fn concurrent_releases_hand_off_to_every_waiter() {
    const WAITERS: usize = 8;

    for fair in [false, true] {
        let permits = Arc::new(Semaphore::with_fairness(0, fair));
        let waiters = (0..WAITERS)
            .map(|_| {
                let permits = permits.clone();
                spawn(move || {
                    let acquired = permits.try_acquire_for(LONG_DELAY);
                    (acquired, Instant::now())
                })
            })
            .collect::<Vec<_>>();
        await_until("all acquirers to queue", || permits.queue_length() == WAITERS);

        let start = Arc::new(CyclicBarrier::new(WAITERS).unwrap());
        let releasers = (0..WAITERS)
            .map(|_| {
                let permits = permits.clone();
                let start = start.clone();
                spawn(move || {
                    start.wait().unwrap();
                    permits.release().unwrap();
                })
            })
            .collect::<Vec<_>>();
        for releaser in releasers {
            releaser.join().unwrap();
        }
        let released = Instant::now();

        for waiter in waiters {
            let (acquired, woke) = waiter.join().unwrap();
            assert_eq!(acquired, Ok(true));
            assert!(woke.saturating_duration_since(released) < MEDIUM_DELAY * 5);
        }
        assert_eq!(permits.available_permits(), 0);
        assert!(!permits.has_queued_threads());
    }
}

#[test]
pub fn hold_count_tracks_nesting() {
    let lock = ReentrantLock::new();
    for n in 1..=5 {
        lock.lock();
        assert_eq!(lock.hold_count(), n);
    }
    for k in 1..=5 {
        lock.unlock().unwrap();
        assert_eq!(lock.hold_count(), 5 - k);
    }
    assert!(!lock.is_locked());
    assert_eq!(lock.unlock(), Err(SyncError::IllegalMonitorState));
}

#[test]
pub fn semaphore_arithmetic() {
    let semaphore = Semaphore::new(10);
    semaphore.acquire_many(4).unwrap();
    semaphore.release_many(2).unwrap();
    assert_eq!(semaphore.available_permits(), 8);
    semaphore.reduce_permits(9).unwrap();
    assert_eq!(semaphore.available_permits(), -1);
    assert!(!semaphore.try_acquire());
    semaphore.release_many(3).unwrap();
    assert_eq!(semaphore.drain_permits(), 2);
    assert_eq!(semaphore.available_permits(), 0);
}

#[test]
pub fn zero_timeout_is_a_single_attempt() {
    let lock = Arc::new(ReentrantLock::new());
    let holder = lock.clone();
    let locked = Arc::new(CountDownLatch::new(1));
    let release = Arc::new(CountDownLatch::new(1));
    let handle = {
        let locked = locked.clone();
        let release = release.clone();
        spawn(move || {
            holder.lock();
            locked.count_down();
            release.wait().unwrap();
            holder.unlock().unwrap();
        })
    };
    locked.wait().unwrap();

    assert_eq!(lock.try_lock_for(Duration::ZERO), Ok(false));
    assert!(!lock.has_queued_threads());
    assert_eq!(Semaphore::new(0).try_acquire_for(Duration::ZERO), Ok(false));

    release.count_down();
    handle.join().unwrap();
    assert_eq!(lock.try_lock_for(Duration::ZERO), Ok(true));
    lock.unlock().unwrap();
}

fn fifo_round_trip(queue: &dyn BlockingQueue<usize>, capacity: usize) {
    for i in 0..capacity {
        queue.offer(i).unwrap();
    }
    assert_eq!(queue.remaining_capacity(), 0);
    assert!(queue.offer(capacity).unwrap_err().is_full());
    for i in 0..capacity {
        assert_eq!(queue.poll(), Some(i));
    }
    assert_eq!(queue.poll(), None);
    assert!(queue.is_empty());
}

#[test]
pub fn bounded_queues_are_fifo() {
    fifo_round_trip(&ArrayBlockingQueue::<usize>::new(8).unwrap(), 8);
    fifo_round_trip(&ArrayBlockingQueue::<usize>::with_fairness(3, true).unwrap(), 3);
    fifo_round_trip(&LinkedBlockingQueue::<usize>::with_capacity(8).unwrap(), 8);
}

#[test]
pub fn producers_and_consumers_exchange_everything() {
    let queues: Vec<Arc<dyn BlockingQueue<usize>>> = vec![
        Arc::new(ArrayBlockingQueue::<usize>::new(4).unwrap()),
        Arc::new(LinkedBlockingQueue::<usize>::with_capacity(4).unwrap()),
        Arc::new(PriorityBlockingQueue::<usize>::new()),
        Arc::new(SynchronousQueue::<usize>::new()),
        Arc::new(SynchronousQueue::<usize>::with_fairness(true)),
    ];

    for queue in queues {
        let sum = Arc::new(AtomicUsize::new(0));
        let producers = (0..4)
            .map(|p| {
                let queue = queue.clone();
                spawn(move || {
                    for i in 0..ITERATION {
                        queue.put(p * ITERATION + i).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        let consumers = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let sum = sum.clone();
                spawn(move || {
                    for _ in 0..ITERATION {
                        sum.fetch_add(queue.take().unwrap(), SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in producers.into_iter().chain(consumers) {
            handle.join().unwrap();
        }

        let n = 4 * ITERATION;
        assert_eq!(sum.load(SeqCst), n * (n - 1) / 2);
        assert!(queue.is_empty());
    }
}

#[test]
pub fn synchronous_offer_needs_a_taker() {
    let queue = SynchronousQueue::<i32>::new();
    assert!(queue.offer(1).unwrap_err().is_full());
    assert_eq!(queue.poll(), None);
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.remaining_capacity(), 0);
}

#[test]
pub fn delay_queue_hides_unexpired() {
    let queue = DelayQueue::new();
    queue.offer(DelayedItem::new("later", LONG_DELAY)).unwrap();
    queue.offer(DelayedItem::new("now", Duration::ZERO)).unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.poll().map(DelayedItem::into_inner), Some("now"));
    assert!(queue.poll().is_none());
    assert_eq!(queue.iter().count(), 1);
}

#[test]
pub fn barrier_releases_all_parties() {
    let tripped = Arc::new(AtomicUsize::new(0));
    let counter = tripped.clone();
    let barrier = Arc::new(
        CyclicBarrier::with_action(THREAD_NUM, move || {
            counter.fetch_add(1, SeqCst);
        })
        .unwrap(),
    );

    for _round in 0..3 {
        let handles = (0..THREAD_NUM)
            .map(|_| {
                let barrier = barrier.clone();
                spawn(move || barrier.wait().unwrap())
            })
            .collect::<Vec<_>>();
        let mut indices = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>();
        indices.sort();
        assert_eq!(indices, (0..THREAD_NUM).collect::<Vec<_>>());
    }
    assert_eq!(tripped.load(SeqCst), 3);
    assert!(!barrier.is_broken());
}

#[test]
#[serial]
pub fn barrier_timeout_breaks_it_for_others() {
    let barrier = Arc::new(CyclicBarrier::new(3).unwrap());
    let waiter = {
        let barrier = barrier.clone();
        spawn(move || barrier.wait())
    };
    assert_eq!(barrier.wait_timeout(SHORT_DELAY), Err(SyncError::Timeout));
    assert_eq!(waiter.join().unwrap(), Err(SyncError::BrokenBarrier));
    assert!(barrier.is_broken());
    barrier.reset();
    assert!(!barrier.is_broken());
}

#[test]
pub fn interrupt_wakes_a_blocked_take() {
    let queue = Arc::new(LinkedBlockingQueue::<u8>::new());
    let taker = {
        let queue = queue.clone();
        spawn(move || queue.take())
    };
    std::thread::sleep(SHORT_DELAY);
    taker.interrupt();
    assert_eq!(taker.join().unwrap(), Err(SyncError::Interrupted));
}

#[test]
pub fn pool_drains_a_shared_counter() {
    let pool = ThreadPoolBuilder::new()
        .core_pool_size(4)
        .maximum_pool_size(4)
        .queue(ArrayBlockingQueue::new(THREAD_NUM * 4).unwrap())
        .build()
        .unwrap();
    let lock = Arc::new(ReentrantLock::new());
    let total = Arc::new(AtomicUsize::new(0));

    let futures = (0..THREAD_NUM * 4)
        .map(|_| {
            let lock = lock.clone();
            let total = total.clone();
            pool.submit(move || {
                let _guard = lock.lock_guard();
                total.fetch_add(1, SeqCst)
            })
            .unwrap()
        })
        .collect::<Vec<_>>();
    for future in futures {
        future.get_timeout(LONG_DELAY).unwrap();
    }

    assert_eq!(total.load(SeqCst), THREAD_NUM * 4);
    ExecutorService::shutdown(&pool);
    assert!(pool.await_termination(LONG_DELAY).unwrap());
    assert_eq!(pool.completed_task_count(), (THREAD_NUM * 4) as u64);
}

#[test]
pub fn shutdown_twice_equals_once() {
    let pool = ThreadPoolExecutor::fixed(2).unwrap();
    pool.execute(|| {}).unwrap();
    pool.shutdown();
    let state = pool.run_state();
    pool.shutdown();
    assert!(pool.run_state() >= state);
    assert!(pool.await_termination(LONG_DELAY).unwrap());
    assert!(matches!(pool.execute(|| {}), Err(SyncError::Rejected(_))));
}
