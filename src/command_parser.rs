use std::thread::available_parallelism;

use clap::*;

pub mod experiment;
pub mod lock_target;

use experiment::Experiment;
use lock_target::LockTarget;

#[derive(Debug, Parser)]
#[clap(name = "qsync benchmark", version)]
/// Throughput benchmarks for the queued synchronizers
pub struct App {
    #[command(subcommand)]
    pub experiment: Option<Experiment>,
    #[command(flatten)]
    pub global_opts: GlobalOpts,
}

fn parallelism() -> usize {
    available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    #[arg(global = true, num_args(0..), value_delimiter = ',', value_terminator("."), long, short, default_values_t = [parallelism()].to_vec())]
    pub threads: Vec<usize>,
    #[arg(global = true, num_args(0..), value_delimiter = ',', value_terminator("."), long, short, default_values_t = [parallelism()].to_vec())]
    pub cpus: Vec<usize>,
    #[arg(global = true, long, short, default_value = "../visualization/output")]
    pub output_path: String,
    /// Seconds each target runs for
    #[arg(global = true, long, short, default_value = "5")]
    pub duration: u64,
    /// Locks to measure; all of them when omitted
    #[arg(global = true, long, short = 'l', value_delimiter = ',')]
    pub lock_target: Option<Vec<LockTarget>>,
    #[arg(global = true, long, short)]
    pub verbose: bool,
}
