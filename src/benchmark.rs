use std::path::Path;

use strum::IntoEnumIterator;

use crate::command_parser::experiment::Experiment;
use crate::command_parser::lock_target::LockTarget;
use crate::command_parser::*;

use self::bencher::Bencher;

pub mod bench_lock;
mod bencher;
mod counter;
mod helper;
mod queue_throughput;
mod records;

pub fn benchmark(
    num_cpu: usize,
    num_thread: usize,
    experiment: Option<Experiment>,
    options: &GlobalOpts,
) {
    let bencher = Bencher {
        num_cpu,
        num_thread,
        experiment,
        targets: match &options.lock_target {
            Some(t) => t.clone(),
            None => LockTarget::iter().collect(),
        },
        output_path: Path::new(&options.output_path).to_path_buf().into_boxed_path(),
        duration: options.duration,
        verbose: options.verbose,
    };

    bencher.benchmark();
}
