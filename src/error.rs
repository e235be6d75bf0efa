//! Error types and the fatal-abort path.
//!
//! Only two kinds of failure travel as values: startup failures (bad
//! configuration, the stack reservation or a worker thread could not be
//! created) and a full job queue. Everything that means the scheduler's own
//! state is inconsistent goes through [`fatal!`] instead.

use crate::job::Job;
use thiserror::Error;

/// Failures surfaced by scheduler startup and shutdown.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse scheduler configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("failed to reserve {bytes} bytes for fiber stacks")]
    StackReservation { bytes: usize },

    #[error("failed to spawn worker thread {id}: {source}")]
    SpawnWorker {
        id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}

/// Returned when a priority queue is observed full while submitting jobs.
///
/// This is backpressure, not a scheduler fault: `submitted` jobs are queued,
/// the rest come back in `rejected` in their original order. The shared
/// counter still accounts for the rejected jobs, so the caller must either
/// resubmit them or subtract them from the counter.
#[derive(Debug, Error)]
#[error("job queue full: {submitted} job(s) queued, {} rejected", rejected.len())]
pub struct QueueFull {
    pub submitted: usize,
    pub rejected: Vec<Job>,
}

/// Logs an unrecoverable scheduler fault and aborts the process.
///
/// Used where continuing would run fibers on corrupted stacks or with
/// ownership state that no longer adds up. Aborting (rather than panicking)
/// keeps the failure from being swallowed by the panic isolation that
/// surrounds every job.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort()
    }};
}

pub(crate) use fatal;
