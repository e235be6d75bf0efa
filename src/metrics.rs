use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Optional scheduler counters, compiled in with the `metrics` feature.
#[derive(Debug)]
pub struct Metrics {
    /// Jobs accepted by a priority queue.
    pub jobs_submitted: AtomicU64,
    /// Jobs run to completion, including those that panicked.
    pub jobs_executed: AtomicU64,
    /// Jobs whose work function panicked.
    pub jobs_panicked: AtomicU64,
    /// Submissions that found a queue full.
    pub queue_full: AtomicU64,
    /// Awaits that had to suspend (the counter did not already match).
    pub awaits: AtomicU64,
    /// Waiting fibers handed back to a worker.
    pub waiters_resumed: AtomicU64,
    /// Fibers created from the bump index.
    pub fibers_created: AtomicU64,
    /// Times a worker went to sleep on the idle condvar.
    pub idle_parks: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_executed: AtomicU64::new(0),
            jobs_panicked: AtomicU64::new(0),
            queue_full: AtomicU64::new(0),
            awaits: AtomicU64::new(0),
            waiters_resumed: AtomicU64::new(0),
            fibers_created: AtomicU64::new(0),
            idle_parks: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            jobs_panicked: self.jobs_panicked.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            awaits: self.awaits.load(Ordering::Relaxed),
            waiters_resumed: self.waiters_resumed.load(Ordering::Relaxed),
            fibers_created: self.fibers_created.load(Ordering::Relaxed),
            idle_parks: self.idle_parks.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_executed: u64,
    pub jobs_panicked: u64,
    pub queue_full: u64,
    pub awaits: u64,
    pub waiters_resumed: u64,
    pub fibers_created: u64,
    pub idle_parks: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_executed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Jobs queued but not yet finished (submitted - executed).
    pub fn backlog(&self) -> i64 {
        self.jobs_submitted as i64 - self.jobs_executed as i64
    }
}
