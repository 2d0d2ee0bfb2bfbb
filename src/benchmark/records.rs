use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationNanoSeconds};

/// One thread's share of a counter run.
#[serde_as]
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct CounterRecord {
    pub id: usize,
    pub cpu_id: usize,
    pub thread_num: usize,
    pub cpu_num: usize,
    pub loop_count: u64,
    pub num_acquire: u64,
    #[serde_as(as = "DurationNanoSeconds")]
    pub cs_length: Duration,
    #[serde_as(as = "DurationNanoSeconds")]
    pub hold_time: Duration,
    pub locktype: String,
}

/// One producer's or consumer's share of a queue run.
#[serde_as]
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct QueueRecord {
    pub id: usize,
    pub role: String,
    pub thread_num: usize,
    pub capacity: usize,
    pub transferred: u64,
    #[serde_as(as = "DurationNanoSeconds")]
    pub blocked_time: Duration,
    pub queue_type: String,
}
