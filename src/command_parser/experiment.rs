use std::{num::ParseIntError, sync::OnceLock, time::Duration};

use clap::Subcommand;
use strum::Display;

const DEFAULT_CS_NANOS: u64 = 1000;
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, Display, Subcommand)]
pub enum Experiment {
    /// Threads increment a shared counter for a fixed critical section
    Counter {
        #[arg(value_parser = parse_duration, long = "cs", default_value = "1000")]
        cs_length: Duration,
    },
    /// Producers and consumers hand items through each blocking queue
    Queue {
        #[arg(long, default_value_t = DEFAULT_CAPACITY)]
        capacity: usize,
    },
}

impl Experiment {
    /// Every experiment with its command line defaults.
    pub fn to_vec_ref() -> Vec<&'static Self> {
        static INSTANCE: OnceLock<Vec<Experiment>> = OnceLock::new();

        INSTANCE
            .get_or_init(|| {
                vec![
                    Experiment::Counter {
                        cs_length: Duration::from_nanos(DEFAULT_CS_NANOS),
                    },
                    Experiment::Queue {
                        capacity: DEFAULT_CAPACITY,
                    },
                ]
            })
            .iter()
            .collect()
    }
}

fn parse_duration(arg: &str) -> Result<Duration, ParseIntError> {
    let nanos = arg.parse::<u64>()?;
    Ok(Duration::from_nanos(nanos))
}
