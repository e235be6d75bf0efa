//! Job definitions and execution logic.
//!
//! Jobs are units of work that can be executed by the scheduler.
//! They encapsulate a closure and the counter that tracks their completion.

use crate::context::Context;
use crate::counter::Counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Dispatch priority of a job. Workers drain `High` before `Normal` and
/// `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// All priorities in dispatch order.
    pub const ALL: [JobPriority; 3] = [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    pub const COUNT: usize = Self::ALL.len();

    /// Index of the priority's queue.
    pub fn index(self) -> usize {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }
}

type Work = Box<dyn FnOnce(&Context<'_>) + Send + 'static>;

/// A unit of work to be executed by the scheduler.
///
/// Jobs consist of a closure to execute and an optional counter that is
/// decremented exactly once when the job finishes, whether the closure
/// returns or panics.
pub struct Job {
    work: Work,
    counter: Option<Counter>,
}

impl Job {
    /// Creates a new job with the given work function.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        Job {
            work: Box::new(work),
            counter: None,
        }
    }

    /// Creates a new job with an associated counter.
    pub fn with_counter<F>(work: F, counter: Counter) -> Self
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        Job {
            work: Box::new(work),
            counter: Some(counter),
        }
    }

    pub fn counter(&self) -> Option<&Counter> {
        self.counter.as_ref()
    }

    /// Stamps the job with the counter of the batch it is submitted in.
    pub(crate) fn stamp(&mut self, counter: &Counter) {
        self.counter = Some(counter.clone());
    }

    /// Runs the job on the current fiber.
    ///
    /// A panic in the work function is caught and logged here so it never
    /// unwinds across a context switch. Returns `false` if the job panicked.
    pub(crate) fn execute(self, ctx: &Context<'_>) -> bool {
        let Job { work, counter } = self;
        let _guard = CounterGuard(counter);

        match catch_unwind(AssertUnwindSafe(|| work(ctx))) {
            Ok(()) => true,
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    *s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.as_str()
                } else {
                    "unknown panic payload"
                };
                log::error!("job panicked on worker {}: {}", ctx.worker_id(), msg);
                false
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Decrements the job's counter when the job is done, including on panic.
struct CounterGuard(Option<Counter>);

impl Drop for CounterGuard {
    fn drop(&mut self) {
        if let Some(counter) = &self.0 {
            counter.decrement();
        }
    }
}
