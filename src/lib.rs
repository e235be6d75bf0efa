//! # fibersched - Cooperative Fiber Job Scheduler
//!
//! A job scheduler that lets a small pool of OS worker threads execute a much
//! larger number of jobs on user-space fibers. Any running job can suspend
//! itself until a completion counter reaches a value, without blocking the
//! thread underneath, and is later resumed on whichever worker finds it ready.
//!
//! ## Architecture
//!
//! - **Job queues**: one bounded lock-free MPMC ring per priority level
//!   (High, Normal, Low), drained in strict priority order.
//! - **Stack allocator**: a fixed pool of guard-banded fiber stacks carved
//!   from one reservation; red-zone corruption aborts the process.
//! - **Fibers**: a fixed arena of stackful contexts. Each fiber is held by
//!   exactly one of a worker, the free list or the wait list at any time.
//! - **Workers**: OS threads that run fibers, resume waiters whose counters
//!   are satisfied, and pull jobs from the queues.
//! - **Counters**: shared atomics tracking job completion.
//!
//! ## Example
//!
//! ```no_run
//! use fibersched::{JobPriority, Scheduler};
//!
//! let scheduler = Scheduler::new(4).unwrap();
//!
//! let counter = scheduler
//!     .run(JobPriority::Normal, |ctx| {
//!         let child = ctx.run(JobPriority::High, |_| println!("child")).unwrap();
//!         // Parks this fiber, not the worker thread.
//!         ctx.wait_for(&child);
//!         println!("parent");
//!     })
//!     .unwrap();
//!
//! scheduler.wait_for(&counter);
//! scheduler.shutdown().unwrap();
//! ```

#[cfg(not(unix))]
compile_error!("fibersched only supports unix targets");

pub mod allocator;
pub mod c_api;
pub mod context;
pub mod counter;
pub mod error;
pub mod fiber;
pub mod fiber_pool;
pub mod job;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod spinlock;
mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

impl PinningStrategy {
    /// Cores for `workers` worker threads, indexed by worker id, or `None`
    /// when no pinning is wanted or the core list is unavailable. Workers
    /// wrap around when there are more workers than cores.
    pub fn cores(self, workers: usize) -> Option<Vec<core_affinity::CoreId>> {
        if self == PinningStrategy::None || workers == 0 {
            return None;
        }
        let Some(all) = core_affinity::get_core_ids().filter(|ids| !ids.is_empty()) else {
            log::warn!("core ids unavailable, worker threads will not be pinned");
            return None;
        };

        let candidates: Vec<_> = match self {
            PinningStrategy::AvoidSMT if all.len() > 1 => all.iter().copied().step_by(2).collect(),
            _ => all,
        };
        Some(
            (0..workers)
                .map(|id| candidates[id % candidates.len()])
                .collect(),
        )
    }
}

pub use context::Context;
pub use counter::Counter;
pub use error::{QueueFull, SchedulerError};
pub use fiber_pool::FiberCensus;
pub use job::{Job, JobPriority};
pub use queue::JobQueue;
pub use scheduler::{IdleConfig, Scheduler, SchedulerConfig};
