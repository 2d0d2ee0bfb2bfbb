use std::{path::Path, sync::Arc, time::Duration};

use crate::command_parser::{experiment::Experiment, lock_target::LockTarget};

use super::{
    bench_lock::BenchLock, counter::counter_benchmark, queue_throughput::queue_benchmark,
};

pub struct Bencher {
    pub num_cpu: usize,
    pub num_thread: usize,
    pub experiment: Option<Experiment>,
    pub targets: Vec<LockTarget>,
    pub output_path: Box<Path>,
    pub duration: u64,
    pub verbose: bool,
}

impl Bencher {
    pub fn benchmark(&self) {
        let experiments = match &self.experiment {
            Some(e) => vec![e],
            None => Experiment::to_vec_ref(),
        };

        for experiment in experiments {
            match *experiment {
                Experiment::Counter { cs_length } => {
                    for target in &self.targets {
                        counter_benchmark(LockBenchInfo {
                            lock_type: Arc::new(target.to_locktype()),
                            target: *target,
                            num_thread: self.num_thread,
                            num_cpu: self.num_cpu,
                            cs_length,
                            duration: Duration::from_secs(self.duration),
                            output_path: &self.output_path,
                            verbose: self.verbose,
                        });
                    }
                }
                Experiment::Queue { capacity } => queue_benchmark(QueueBenchInfo {
                    num_thread: self.num_thread,
                    num_cpu: self.num_cpu,
                    capacity,
                    duration: Duration::from_secs(self.duration),
                    output_path: &self.output_path,
                }),
            }
            log::info!("{} finished", experiment);
        }
    }
}

pub struct LockBenchInfo<'a> {
    pub lock_type: Arc<BenchLock>,
    pub target: LockTarget,
    pub num_thread: usize,
    pub num_cpu: usize,
    pub cs_length: Duration,
    pub duration: Duration,
    pub output_path: &'a Path,
    pub verbose: bool,
}

pub struct QueueBenchInfo<'a> {
    pub num_thread: usize,
    pub num_cpu: usize,
    pub capacity: usize,
    pub duration: Duration,
    pub output_path: &'a Path,
}
