//! High-level scheduler interface.
//!
//! The [`Scheduler`] owns the priority queues, the fiber pool, the stack pool
//! and the worker threads. It is the primary entry point for submitting jobs,
//! tracking their completion via counters, and suspending until counters
//! reach a value.

use crate::PinningStrategy;
use crate::allocator::StackAllocator;
use crate::context::Context;
use crate::counter::Counter;
use crate::error::{QueueFull, SchedulerError, fatal};
use crate::fiber::{FiberContext, FiberId, Handoff, Park, Resume, WaitTarget};
use crate::fiber_pool::{FiberCensus, FiberPool};
use crate::job::{Job, JobPriority};
use crate::queue::JobQueue;
use crate::worker::{self, IdleSignal, Running, WorkerState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};

/// Smallest fiber stack accepted by [`SchedulerConfig::validate`].
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Idle policy for workers that find nothing to run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Sleep on a condition variable once spinning and yielding found
    /// nothing. When false, idle workers only spin and yield. Default: true.
    pub park: bool,
    /// Longest a sleeping worker waits before rescanning, in microseconds.
    /// Default: 500.
    pub park_timeout_us: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            park: true,
            park_timeout_us: 500,
        }
    }
}

/// Configuration for the scheduler.
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes:
///
/// ```
/// use fibersched::SchedulerConfig;
///
/// let config = SchedulerConfig::from_json(r#"{ "worker_threads": 2, "stack_size": 131072 }"#).unwrap();
/// assert_eq!(config.worker_threads, Some(2));
/// assert_eq!(config.queue_capacity, 1024);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads to spawn. `None` spawns one per logical processor
    /// minus one; the thread that awaits a counter from outside the pool
    /// serves as the last worker.
    pub worker_threads: Option<usize>,
    /// Fibers (and fiber stacks) reserved up front. Default: 256.
    pub max_fibers: usize,
    /// Usable bytes per fiber stack. Default: 64 KiB.
    pub stack_size: usize,
    /// Slots per priority queue; must be a power of two. Default: 1024.
    pub queue_capacity: usize,
    /// How worker threads are pinned to cores.
    pub pinning: PinningStrategy,
    pub idle: IdleConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_fibers: 256,
            stack_size: 64 * 1024,
            queue_capacity: 1024,
            pinning: PinningStrategy::None,
            idle: IdleConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Parses a configuration from JSON and validates it.
    pub fn from_json(json: &str) -> Result<Self, SchedulerError> {
        let config: SchedulerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of threads the scheduler will spawn.
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .saturating_sub(1)
        })
    }

    /// Checks the configuration for values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let invalid = |msg: String| Err(SchedulerError::InvalidConfig(msg));

        if self.queue_capacity < 2 || !self.queue_capacity.is_power_of_two() {
            return invalid(format!(
                "queue_capacity must be a power of two of at least 2, got {}",
                self.queue_capacity
            ));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return invalid(format!(
                "stack_size must be at least {} bytes, got {}",
                MIN_STACK_SIZE, self.stack_size
            ));
        }
        // Every worker holds one fiber, and an awaiting fiber needs a
        // replacement to switch to.
        let min_fibers = self.resolved_worker_threads() + 2;
        if self.max_fibers < min_fibers {
            return invalid(format!(
                "max_fibers must be at least {} for {} worker thread(s), got {}",
                min_fibers,
                self.resolved_worker_threads(),
                self.max_fibers
            ));
        }
        if self.max_fibers > u32::MAX as usize {
            return invalid(format!("max_fibers is too large: {}", self.max_fibers));
        }
        if self.idle.park && self.idle.park_timeout_us == 0 {
            return invalid("idle.park_timeout_us must be positive when idle.park is set".into());
        }
        Ok(())
    }
}

/// State shared by the scheduler handle, its worker threads and its fibers.
pub(crate) struct Shared {
    queues: [JobQueue<Job>; JobPriority::COUNT],
    // Fibers are torn down before the stacks they run on are released.
    pub fibers: FiberPool,
    pub stacks: StackAllocator,
    pub idle: IdleSignal,
    pub config: SchedulerConfig,
    active: AtomicBool,
    /// Number of spawned worker threads; also the id of caller workers.
    pub worker_count: usize,
    #[cfg(feature = "metrics")]
    pub metrics: Metrics,
}

/// Raw pointer a fiber's entry function carries back to its scheduler.
#[derive(Clone, Copy)]
struct SharedPtr(*const Shared);

impl Shared {
    fn new(config: SchedulerConfig, worker_count: usize) -> Result<Self, SchedulerError> {
        let stacks = StackAllocator::new(config.max_fibers, config.stack_size)?;
        Ok(Shared {
            queues: std::array::from_fn(|_| JobQueue::with_capacity(config.queue_capacity)),
            fibers: FiberPool::new(config.max_fibers),
            stacks,
            idle: IdleSignal::new(),
            config,
            active: AtomicBool::new(true),
            worker_count,
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Pops the oldest job of the highest non-empty priority.
    pub fn pop_job(&self) -> Option<Job> {
        self.queues.iter().find_map(JobQueue::pop)
    }

    /// True if a worker scanning now would find a job or a satisfied waiter.
    pub fn has_runnable(&self) -> bool {
        self.queues.iter().any(|queue| !queue.is_empty()) || self.fibers.has_satisfied()
    }

    pub fn run_jobs<I>(&self, priority: JobPriority, jobs: I, counter: &Counter) -> Result<(), QueueFull>
    where
        I: IntoIterator<Item = Job>,
    {
        let queue = &self.queues[priority.index()];
        let mut jobs = jobs.into_iter();
        let mut submitted = 0;

        while let Some(mut job) = jobs.next() {
            job.stamp(counter);
            if let Err(job) = queue.push(job) {
                let rejected: Vec<Job> = std::iter::once(job)
                    .chain(jobs.map(|mut job| {
                        job.stamp(counter);
                        job
                    }))
                    .collect();
                log::warn!(
                    "{:?} queue full: {} job(s) queued, {} rejected",
                    priority,
                    submitted,
                    rejected.len()
                );
                #[cfg(feature = "metrics")]
                {
                    self.metrics.jobs_submitted.fetch_add(submitted as u64, Ordering::Relaxed);
                    self.metrics.queue_full.fetch_add(1, Ordering::Relaxed);
                }
                self.idle.notify_all();
                return Err(QueueFull {
                    submitted,
                    rejected,
                });
            }
            submitted += 1;
        }

        #[cfg(feature = "metrics")]
        self.metrics.jobs_submitted.fetch_add(submitted as u64, Ordering::Relaxed);

        match submitted {
            0 => {}
            1 => self.idle.notify_one(),
            _ => self.idle.notify_all(),
        }
        Ok(())
    }

    pub fn run_batch<I, F>(&self, priority: JobPriority, works: I) -> Result<Counter, QueueFull>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        let jobs: Vec<Job> = works.into_iter().map(Job::new).collect();
        let counter = Counter::new(jobs.len());
        self.run_jobs(priority, jobs, &counter)?;
        Ok(counter)
    }

    /// Runs a job on the current fiber and wakes sleepers that may be waiting
    /// for its counter.
    pub fn execute(&self, job: Job) {
        let completed = job.execute(&Context::new(self));
        #[cfg(feature = "metrics")]
        {
            self.metrics.jobs_executed.fetch_add(1, Ordering::Relaxed);
            if !completed {
                self.metrics.jobs_panicked.fetch_add(1, Ordering::Relaxed);
            }
        }
        #[cfg(not(feature = "metrics"))]
        let _ = completed;
        self.idle.notify_all();
    }

    pub fn await_counter(&self, counter: &Counter, expected: usize) {
        if counter.value() == expected {
            return;
        }

        #[cfg(feature = "metrics")]
        self.metrics.awaits.fetch_add(1, Ordering::Relaxed);

        match worker::current_in(self) {
            Some(running) => self.park_current(running, counter, expected),
            None => {
                let worker = WorkerState::caller(self.worker_count, counter.clone(), expected);
                worker::dispatch(self, &worker);
            }
        }
    }

    /// Parks the running fiber on `counter` and switches its worker to a
    /// satisfied waiter or an idle fiber.
    fn park_current(&self, running: Running, counter: &Counter, expected: usize) {
        let fiber = self.fibers.get(running.fiber);
        // SAFETY: the running fiber is owned by the worker executing it.
        unsafe {
            fiber.set_wait(WaitTarget {
                counter: counter.clone(),
                expected,
            })
        };

        let next = match self.fibers.take_satisfied() {
            Some(id) => id,
            None => self.take_idle_fiber(),
        };

        // SAFETY: the suspender belongs to the fiber executing this call.
        let suspender = unsafe { &*running.suspender };
        match suspender.suspend(Handoff::Switch {
            next,
            park: Park::Wait,
        }) {
            Resume::Run(worker) => worker::set_current(Some(Running { worker, ..running })),
            Resume::Terminate => {
                fatal!("fiber {} terminated while waiting on a counter", running.fiber)
            }
        }
    }

    /// Takes a fiber off the free list, or creates one if the list is empty.
    pub fn take_idle_fiber(&self) -> FiberId {
        if let Some(id) = self.fibers.pop_free() {
            return id;
        }

        let Some(id) = self.fibers.bump() else {
            fatal!(
                "fiber pool exhausted: all {} fibers are in use",
                self.fibers.capacity()
            );
        };
        let Some(stack) = self.stacks.alloc() else {
            fatal!(
                "stack pool exhausted: all {} stacks are in use",
                self.stacks.capacity()
            );
        };

        let shared = SharedPtr(self);
        let context = FiberContext::new(stack, move |suspender, resume| {
            // SAFETY: fibers are torn down before `Shared` is released.
            let shared = unsafe { &*shared.0 };
            worker::fiber_main(shared, id, suspender, resume)
        });
        // SAFETY: `bump` made the caller the fiber's owner.
        unsafe { *self.fibers.get(id).context_mut() = Some(context) };

        #[cfg(feature = "metrics")]
        self.metrics.fibers_created.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "created fiber {} on stack {} ({} of {})",
            id,
            stack.index(),
            id.index() + 1,
            self.fibers.capacity()
        );
        id
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let stacks = &self.stacks;
        let leaked = self.fibers.teardown(|mut context| {
            if context.resume(Resume::Terminate).is_some() || !context.is_finished() {
                log::error!("fiber on stack {} ignored termination", context.stack().index());
                std::mem::forget(context);
                return;
            }
            stacks.release(context.stack());
        });
        if leaked > 0 {
            log::warn!(
                "{} fiber(s) still suspended at shutdown were leaked with their stacks",
                leaked
            );
        }
    }
}

/// The fiber job scheduler.
///
/// Owns a pool of worker threads that multiplex jobs onto a fixed pool of
/// fibers. Jobs are submitted into one of three priority queues and report
/// completion through a [`Counter`]; any job can suspend its fiber until a
/// counter reaches a value without blocking the worker thread underneath.
pub struct Scheduler {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl Scheduler {
    /// Creates a scheduler with the default configuration: one worker thread
    /// per logical processor minus one.
    ///
    /// # Example
    ///
    /// ```
    /// use fibersched::Scheduler;
    ///
    /// let scheduler = Scheduler::init().unwrap();
    /// scheduler.shutdown().unwrap();
    /// ```
    pub fn init() -> Result<Self, SchedulerError> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Creates a scheduler with the specified number of worker threads.
    ///
    /// # Arguments
    ///
    /// * `worker_threads` - Number of worker threads to spawn. Zero is valid:
    ///   jobs then only run while some thread awaits a counter.
    pub fn new(worker_threads: usize) -> Result<Self, SchedulerError> {
        Self::with_config(SchedulerConfig {
            worker_threads: Some(worker_threads),
            ..SchedulerConfig::default()
        })
    }

    /// Creates a scheduler from an explicit configuration.
    ///
    /// Reserves the fiber and stack pools, then spawns the worker threads.
    /// If a thread cannot be spawned, the ones already running are shut down
    /// before the error is returned.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let worker_threads = config.resolved_worker_threads();
        let cores = config.pinning.cores(worker_threads);

        let mut scheduler = Scheduler {
            shared: Arc::new(Shared::new(config, worker_threads)?),
            handles: Vec::with_capacity(worker_threads),
            stopped: false,
        };

        for id in 0..worker_threads {
            let core = cores.as_ref().and_then(|cores| cores.get(id).copied());
            let handle = worker::spawn(id, Arc::clone(&scheduler.shared), core)
                .map_err(|source| SchedulerError::SpawnWorker { id, source })?;
            scheduler.handles.push(handle);
        }

        let config = &scheduler.shared.config;
        log::debug!(
            "scheduler started: {} worker thread(s), {} fibers of {} bytes, {} slots per queue",
            worker_threads,
            config.max_fibers,
            scheduler.shared.stacks.stack_size(),
            config.queue_capacity
        );
        Ok(scheduler)
    }

    /// Submits jobs to the queue of the given priority.
    ///
    /// Every job is stamped with `counter`, which the caller should have
    /// initialized to (or increased by) the number of jobs. If the queue is
    /// observed full, submission stops and the jobs not queued are handed
    /// back in [`QueueFull`]; retrying, dropping or escalating is up to the
    /// caller.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fibersched::{Counter, Job, JobPriority, Scheduler};
    ///
    /// let scheduler = Scheduler::new(4).unwrap();
    /// let counter = Counter::new(2);
    /// let jobs = vec![Job::new(|_| println!("one")), Job::new(|_| println!("two"))];
    /// scheduler.run_jobs(JobPriority::High, jobs, &counter).unwrap();
    /// scheduler.wait_for(&counter);
    /// ```
    pub fn run_jobs<I>(&self, priority: JobPriority, jobs: I, counter: &Counter) -> Result<(), QueueFull>
    where
        I: IntoIterator<Item = Job>,
    {
        self.shared.run_jobs(priority, jobs, counter)
    }

    /// Submits a single job and returns a counter that reaches zero when it
    /// has run.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fibersched::{JobPriority, Scheduler};
    ///
    /// let scheduler = Scheduler::new(4).unwrap();
    /// let counter = scheduler.run(JobPriority::Normal, |_| println!("Hello from a job!")).unwrap();
    /// scheduler.wait_for(&counter);
    /// ```
    pub fn run<F>(&self, priority: JobPriority, work: F) -> Result<Counter, QueueFull>
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        self.shared.run_batch(priority, [work])
    }

    /// Submits several jobs under one counter initialized to their number.
    pub fn run_batch<I, F>(&self, priority: JobPriority, works: I) -> Result<Counter, QueueFull>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        self.shared.run_batch(priority, works)
    }

    /// Suspends until `counter` equals `expected`.
    ///
    /// Called from a job, this parks the job's fiber and lets the worker run
    /// other fibers in the meantime. Called from any other thread, the thread
    /// itself serves as a worker (running queued jobs and resumable fibers)
    /// until the counter matches. Either way the OS thread never blocks on the
    /// counter. A counter that never reaches `expected` suspends the caller
    /// forever.
    pub fn await_counter(&self, counter: &Counter, expected: usize) {
        self.shared.await_counter(counter, expected)
    }

    /// Suspends until `counter` reaches zero.
    pub fn wait_for(&self, counter: &Counter) {
        self.shared.await_counter(counter, 0)
    }

    /// Samples which owner holds each fiber.
    pub fn census(&self) -> FiberCensus {
        self.shared.fibers.census()
    }

    /// Returns the number of spawned worker threads.
    pub fn num_workers(&self) -> usize {
        self.shared.worker_count
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Returns a snapshot of the scheduler's counters.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Shuts the scheduler down.
    ///
    /// Workers keep running until the queues are empty and no waiting fiber
    /// is resumable, then exit and are joined. Anything left after that (all
    /// queued work, when no threads were spawned) runs on the calling thread.
    /// Fibers still waiting on counters that never matched are leaked.
    ///
    /// Returns an error if any worker thread panicked.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), SchedulerError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        self.shared.active.store(false, Ordering::Release);
        self.shared.idle.notify_all();

        let mut panicked = 0;
        for (id, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                log::error!("worker {} panicked during execution", id);
                panicked += 1;
            }
        }

        if self.shared.has_runnable() {
            let worker = WorkerState::spawned(self.shared.worker_count);
            worker::dispatch(&self.shared, &worker);
        }

        let waiting = self.shared.fibers.waiting_len();
        if waiting > 0 {
            log::warn!("{} fiber(s) still waiting on counters at shutdown", waiting);
        }
        log::debug!("scheduler stopped");

        if panicked > 0 {
            Err(SchedulerError::WorkerPanicked(panicked))
        } else {
            Ok(())
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("scheduler shutdown failed: {}", err);
        }
    }
}
