use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use histo::Histogram;
use quanta::Clock;

use super::{
    bench_lock::{BenchLock, CounterLock},
    bencher::LockBenchInfo,
    helper::{create_writer, pin_to_cpu},
    records::CounterRecord,
};

pub fn counter_benchmark(info: LockBenchInfo<'_>) {
    let file_name = format!("counter_{}.csv", info.target);
    let mut writer = match create_writer(&info.output_path.join(&file_name)) {
        Ok(writer) => writer,
        Err(e) => {
            log::error!("Failed to create {}: {}", file_name, e);
            return;
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let locktype = info.target.to_string();

    let handles = (0..info.num_thread)
        .map(|id| {
            let lock = info.lock_type.clone();
            let stop = stop.clone();
            let locktype = locktype.clone();
            let (num_thread, num_cpu, cs_length) = (info.num_thread, info.num_cpu, info.cs_length);
            thread::Builder::new()
                .name(format!("counter-{}", id))
                .spawn(move || {
                    thread_job(id, num_thread, num_cpu, cs_length, &stop, &lock, locktype)
                })
        })
        .collect::<Result<Vec<_>, _>>();

    let handles = match handles {
        Ok(handles) => handles,
        Err(e) => {
            log::error!("Failed to spawn counter threads: {}", e);
            stop.store(true, Ordering::Release);
            return;
        }
    };

    thread::sleep(info.duration);
    stop.store(true, Ordering::Release);

    let mut results = Vec::with_capacity(handles.len());
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(record) => results.push(record),
            Err(_) => log::error!("Error joining thread: {}", i),
        }
    }

    for result in &results {
        if let Err(e) = writer.serialize(result) {
            log::error!("Failed to write record: {}", e);
        }
    }
    if let Err(e) = writer.flush() {
        log::error!("Failed to flush {}: {}", file_name, e);
    }

    let total_count: u64 = results.iter().map(|r| r.loop_count).sum();
    let counter = info.lock_type.value();
    if counter != total_count {
        log::error!(
            "{}: counter is {} but threads counted {}",
            locktype,
            counter,
            total_count
        );
    }

    if info.verbose {
        let mut histogram = Histogram::with_buckets(10);
        for result in &results {
            histogram.add(result.num_acquire);
        }
        log::debug!("acquisitions per thread for {}:\n{}", locktype, histogram);
    }

    log::info!(
        "Finish Benchmark for {}: Total Counter {}",
        locktype,
        total_count
    );
}

fn thread_job(
    id: usize,
    num_thread: usize,
    num_cpu: usize,
    cs_length: Duration,
    stop: &AtomicBool,
    lock: &BenchLock,
    locktype: String,
) -> CounterRecord {
    let cpu_id = pin_to_cpu(id, num_cpu);
    let timer = Clock::new();

    let mut loop_count = 0u64;
    let mut num_acquire = 0u64;
    let mut hold_time = Duration::ZERO;

    while !stop.load(Ordering::Acquire) {
        lock.with_lock(&mut |counter: &mut u64| {
            num_acquire += 1;
            let begin = timer.now();

            loop {
                *counter += 1;
                loop_count += 1;
                if timer.now() - begin >= cs_length {
                    break;
                }
            }
            hold_time += timer.now() - begin;
        });
    }
    log::debug!("Thread {} finished with result {}", id, loop_count);

    CounterRecord {
        id,
        cpu_id,
        thread_num: num_thread,
        cpu_num: num_cpu,
        loop_count,
        num_acquire,
        cs_length,
        hold_time,
        locktype,
    }
}
