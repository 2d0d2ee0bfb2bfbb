use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use libqsync::{
    executor::{ExecutorService, TaskFuture, ThreadPoolExecutor},
    queue::{
        ArrayBlockingQueue, BlockingQueue, LinkedBlockingQueue, OfferError, SynchronousQueue,
    },
    SyncError,
};
use quanta::Clock;
use strum::{Display, EnumIter, IntoEnumIterator};

use super::{
    bencher::QueueBenchInfo,
    helper::{create_writer, pin_to_cpu},
    records::QueueRecord,
};

const PATIENCE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Display, EnumIter)]
enum QueueType {
    ArrayBlockingQueue,
    FairArrayBlockingQueue,
    LinkedBlockingQueue,
    SynchronousQueue,
}

impl QueueType {
    fn build(self, capacity: usize) -> Result<Arc<dyn BlockingQueue<u64>>, SyncError> {
        Ok(match self {
            QueueType::ArrayBlockingQueue => Arc::new(ArrayBlockingQueue::new(capacity)?),
            QueueType::FairArrayBlockingQueue => {
                Arc::new(ArrayBlockingQueue::with_fairness(capacity, true)?)
            }
            QueueType::LinkedBlockingQueue => Arc::new(LinkedBlockingQueue::with_capacity(capacity)?),
            QueueType::SynchronousQueue => Arc::new(SynchronousQueue::new()),
        })
    }
}

#[derive(Debug, Clone, Copy, Display)]
enum Role {
    Producer,
    Consumer,
}

pub fn queue_benchmark(info: QueueBenchInfo<'_>) {
    let mut writer = match create_writer(&info.output_path.join("queue_throughput.csv")) {
        Ok(writer) => writer,
        Err(e) => {
            log::error!("Failed to create queue_throughput.csv: {}", e);
            return;
        }
    };

    // One producer and one consumer at minimum.
    let num_thread = info.num_thread.max(2);

    for queue_type in QueueType::iter() {
        let results = match run_one(queue_type, num_thread, &info) {
            Ok(results) => results,
            Err(e) => {
                log::error!("{} benchmark failed: {}", queue_type, e);
                continue;
            }
        };

        for result in &results {
            if let Err(e) = writer.serialize(result) {
                log::error!("Failed to write record: {}", e);
            }
        }

        let produced: u64 = results
            .iter()
            .filter(|r| r.role == Role::Producer.to_string())
            .map(|r| r.transferred)
            .sum();
        let consumed: u64 = results
            .iter()
            .filter(|r| r.role == Role::Consumer.to_string())
            .map(|r| r.transferred)
            .sum();
        log::info!(
            "Finish Benchmark for {}: produced {}, consumed {}",
            queue_type,
            produced,
            consumed
        );
    }

    if let Err(e) = writer.flush() {
        log::error!("Failed to flush queue_throughput.csv: {}", e);
    }
}

fn run_one(
    queue_type: QueueType,
    num_thread: usize,
    info: &QueueBenchInfo<'_>,
) -> Result<Vec<QueueRecord>, SyncError> {
    let queue = queue_type.build(info.capacity)?;
    let pool = ThreadPoolExecutor::fixed(num_thread)?;
    let stop = Arc::new(AtomicBool::new(false));

    let mut futures: Vec<TaskFuture<QueueRecord>> = Vec::with_capacity(num_thread);
    for id in 0..num_thread {
        let role = if id % 2 == 0 {
            Role::Producer
        } else {
            Role::Consumer
        };
        let (queue, stop) = (queue.clone(), stop.clone());
        let (num_cpu, capacity) = (info.num_cpu, info.capacity);
        let queue_type = queue_type.to_string();
        futures.push(pool.submit(move || {
            pin_to_cpu(id, num_cpu);
            let (transferred, blocked_time) = match role {
                Role::Producer => produce(&*queue, &stop),
                Role::Consumer => consume(&*queue, &stop),
            };
            QueueRecord {
                id,
                role: role.to_string(),
                thread_num: num_thread,
                capacity,
                transferred,
                blocked_time,
                queue_type,
            }
        })?);
    }

    std::thread::sleep(info.duration);
    stop.store(true, Ordering::Release);

    let results = futures
        .into_iter()
        .map(|future| future.join())
        .collect::<Result<Vec<_>, _>>();

    pool.shutdown();
    pool.await_termination(PATIENCE * 100)?;
    results
}

fn produce(queue: &dyn BlockingQueue<u64>, stop: &AtomicBool) -> (u64, Duration) {
    let timer = Clock::new();
    let mut transferred = 0u64;
    let mut blocked = Duration::ZERO;

    while !stop.load(Ordering::Acquire) {
        let begin = timer.now();
        let offered = queue.offer_timeout(transferred, PATIENCE);
        blocked += timer.now() - begin;
        match offered {
            Ok(()) => transferred += 1,
            Err(OfferError::Full(_)) | Err(OfferError::Timeout(_)) => {}
            Err(_) => break,
        }
    }
    (transferred, blocked)
}

fn consume(queue: &dyn BlockingQueue<u64>, stop: &AtomicBool) -> (u64, Duration) {
    let timer = Clock::new();
    let mut transferred = 0u64;
    let mut blocked = Duration::ZERO;

    while !stop.load(Ordering::Acquire) {
        let begin = timer.now();
        let polled = queue.poll_timeout(PATIENCE);
        blocked += timer.now() - begin;
        match polled {
            Ok(Some(_)) => transferred += 1,
            Ok(None) => {}
            Err(_) => break,
        }
    }
    (transferred, blocked)
}
