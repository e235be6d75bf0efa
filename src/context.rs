//! Context type for safe access to the scheduler from within jobs.

use crate::counter::Counter;
use crate::error::QueueFull;
use crate::job::{Job, JobPriority};
use crate::scheduler::Shared;
use crate::worker;

/// Handle passed to every job, giving access to the scheduler running it.
///
/// Jobs use it to submit child jobs and to wait for them. Waiting from a job
/// suspends only the job's fiber; the worker thread moves on to other work.
pub struct Context<'a> {
    shared: &'a Shared,
}

impl<'a> Context<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Context { shared }
    }

    /// Submits jobs stamped with `counter`. See [`Scheduler::run_jobs`].
    ///
    /// [`Scheduler::run_jobs`]: crate::Scheduler::run_jobs
    pub fn run_jobs<I>(&self, priority: JobPriority, jobs: I, counter: &Counter) -> Result<(), QueueFull>
    where
        I: IntoIterator<Item = Job>,
    {
        self.shared.run_jobs(priority, jobs, counter)
    }

    /// Submits a child job and returns its counter.
    pub fn run<F>(&self, priority: JobPriority, work: F) -> Result<Counter, QueueFull>
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        self.shared.run_batch(priority, [work])
    }

    /// Submits several child jobs under one counter.
    pub fn run_batch<I, F>(&self, priority: JobPriority, works: I) -> Result<Counter, QueueFull>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        self.shared.run_batch(priority, works)
    }

    /// Parks the current fiber until `counter` equals `expected`.
    ///
    /// The job may resume on a different worker thread than it suspended on.
    pub fn await_counter(&self, counter: &Counter, expected: usize) {
        self.shared.await_counter(counter, expected)
    }

    /// Parks the current fiber until `counter` reaches zero.
    pub fn wait_for(&self, counter: &Counter) {
        self.shared.await_counter(counter, 0)
    }

    /// Id of the worker currently running this job.
    ///
    /// Spawned workers are numbered from zero; a thread serving as a worker
    /// while it awaits a counter from outside the pool reports
    /// [`num_workers`](Self::num_workers). Ids can change across an await.
    pub fn worker_id(&self) -> usize {
        match worker::current_in(self.shared) {
            // SAFETY: the fiber calling this has not suspended since the
            // record was written.
            Some(running) => unsafe { running.worker.get() }.id(),
            None => self.shared.worker_count,
        }
    }

    /// Number of spawned worker threads.
    pub fn num_workers(&self) -> usize {
        self.shared.worker_count
    }
}
