//! Worker threads and the per-worker scheduling loop.
//!
//! Every worker runs a *dispatcher* on its thread's own stack. The dispatcher
//! never executes jobs itself: it resumes one fiber at a time and acts on the
//! [`Handoff`] the fiber suspends with, parking the now saved fiber and moving
//! on to the next one. Inside each fiber runs [`fiber_main`], the loop that
//! actually looks for work:
//!
//! 1. **Seeking**: scan the wait list for a fiber whose counter has reached
//!    its target; failing that, pop a job from the High, Normal and Low
//!    queues in that order.
//! 2. **Resuming**: a satisfied waiter was found. The current fiber hands the
//!    worker to it and goes back to the free list.
//! 3. **Executing**: a job was found and runs to completion on the current
//!    fiber, then the loop starts over.
//!
//! When nothing is runnable the worker backs off (spin, then yield, then an
//! optional timed sleep) and retries.

use crate::counter::Counter;
use crate::error::fatal;
use crate::fiber::{FiberId, Handoff, Park, Resume, SchedSuspender};
use crate::job::Job;
use crate::scheduler::Shared;
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What a dispatcher is running for.
pub(crate) enum Role {
    /// A thread spawned at startup; retires once the scheduler shuts down
    /// and nothing is left to run.
    Spawned,
    /// A thread outside the pool that called `await_counter`; serves as a
    /// worker until `counter` equals `expected`.
    Caller { counter: Counter, expected: usize },
}

/// Per-dispatcher state, living on the worker thread's own stack.
pub(crate) struct WorkerState {
    id: usize,
    role: Role,
}

impl WorkerState {
    pub fn spawned(id: usize) -> Self {
        WorkerState {
            id,
            role: Role::Spawned,
        }
    }

    pub fn caller(id: usize, counter: Counter, expected: usize) -> Self {
        WorkerState {
            id,
            role: Role::Caller { counter, expected },
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// True once a caller worker's counter has reached its target.
    fn is_released(&self) -> bool {
        match &self.role {
            Role::Spawned => false,
            Role::Caller { counter, expected } => counter.value() == *expected,
        }
    }

    /// True if a spawned worker may leave now that nothing was runnable.
    fn may_retire(&self, shared: &Shared) -> bool {
        matches!(self.role, Role::Spawned) && !shared.is_active()
    }
}

/// Pointer to the [`WorkerState`] of the dispatcher that resumed a fiber.
///
/// Valid until that fiber suspends again.
#[derive(Clone, Copy)]
pub(crate) struct WorkerRef(*const WorkerState);

impl WorkerRef {
    fn new(worker: &WorkerState) -> Self {
        WorkerRef(worker)
    }

    /// # Safety
    ///
    /// The fiber holding this reference must not have suspended since it
    /// received it.
    pub unsafe fn get<'a>(self) -> &'a WorkerState {
        unsafe { &*self.0 }
    }
}

/// Thread-local record of the fiber currently executing on this thread.
#[derive(Clone, Copy)]
pub(crate) struct Running {
    pub shared: *const Shared,
    pub fiber: FiberId,
    pub suspender: *const SchedSuspender,
    pub worker: WorkerRef,
}

thread_local! {
    static CURRENT: Cell<Option<Running>> = const { Cell::new(None) };
}

// The accessors are never inlined: a fiber that suspends can wake up on a
// different thread, and a thread-local address cached across the switch would
// point at the old thread's slot.

#[inline(never)]
pub(crate) fn current() -> Option<Running> {
    CURRENT.with(Cell::get)
}

#[inline(never)]
pub(crate) fn set_current(running: Option<Running>) {
    CURRENT.with(|cell| cell.set(running));
}

/// Returns the fiber running on this thread if it belongs to `shared`.
pub(crate) fn current_in(shared: &Shared) -> Option<Running> {
    current().filter(|running| std::ptr::eq(running.shared, shared))
}

/// Runs fibers on the calling thread on behalf of `worker` until one of them
/// hands back an [`Handoff::Exit`].
pub(crate) fn dispatch(shared: &Shared, worker: &WorkerState) {
    let outer = current();
    let mut current = shared.take_idle_fiber();

    loop {
        let fiber = shared.fibers.get(current);
        // SAFETY: the dispatcher owns `current` until it parks it below.
        let Some(context) = (unsafe { fiber.context_mut() }).as_mut() else {
            fatal!("fiber {} was scheduled without a context", current);
        };

        let handoff = context.resume(Resume::Run(WorkerRef::new(worker)));

        let stack = context.stack();
        if !shared.stacks.check_redzone(&stack) {
            fatal!(
                "red zone of fiber {} (stack {}) corrupted on worker {}",
                current,
                stack.index(),
                worker.id()
            );
        }

        match handoff {
            Some(Handoff::Switch { next, park }) => {
                shared.fibers.park(current, park);
                if park == Park::Wait {
                    // The counter may already have moved; let a sleeper rescan.
                    shared.idle.notify_one();
                }
                current = next;
            }
            Some(Handoff::Exit) => {
                shared.fibers.park(current, Park::Free);
                break;
            }
            None => fatal!("fiber {} returned from the worker loop", current),
        }
    }

    set_current(outer);
}

/// Entry function of every scheduler fiber.
pub(crate) fn fiber_main(
    shared: &Shared,
    me: FiberId,
    suspender: &SchedSuspender,
    mut resume: Resume,
) {
    loop {
        let worker = match resume {
            Resume::Run(worker) => worker,
            Resume::Terminate => return,
        };
        set_current(Some(Running {
            shared,
            fiber: me,
            suspender,
            worker,
        }));
        let handoff = seek(shared);
        resume = suspender.suspend(handoff);
    }
}

enum Acquired {
    Waiter(FiberId),
    Job(Job),
}

/// Resuming a satisfied waiter wins over fresh work so dependency chains
/// drain before new top-level jobs are admitted.
fn acquire(shared: &Shared) -> Option<Acquired> {
    if let Some(id) = shared.fibers.take_satisfied() {
        return Some(Acquired::Waiter(id));
    }
    shared.pop_job().map(Acquired::Job)
}

/// Runs jobs on the current fiber until the worker must be handed to
/// another fiber or released.
fn seek(shared: &Shared) -> Handoff {
    let mut idle = Idle::new();
    loop {
        // Re-read every round: executing a job may have migrated the fiber.
        let Some(running) = current() else {
            fatal!("worker loop running outside a fiber");
        };
        // SAFETY: the fiber has not suspended since `running` was recorded.
        let worker = unsafe { running.worker.get() };

        if worker.is_released() {
            return Handoff::Exit;
        }

        match acquire(shared) {
            Some(Acquired::Waiter(next)) => {
                #[cfg(feature = "metrics")]
                shared.metrics.waiters_resumed.fetch_add(1, Ordering::Relaxed);
                return Handoff::Switch {
                    next,
                    park: Park::Free,
                };
            }
            Some(Acquired::Job(job)) => {
                idle.reset();
                shared.execute(job);
            }
            None if worker.may_retire(shared) => return Handoff::Exit,
            None => idle.snooze(shared, worker),
        }
    }
}

/// Condition variable idle workers sleep on.
pub(crate) struct IdleSignal {
    lock: Mutex<()>,
    condvar: Condvar,
    sleepers: AtomicUsize,
}

impl IdleSignal {
    pub fn new() -> Self {
        IdleSignal {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            sleepers: AtomicUsize::new(0),
        }
    }

    pub fn notify_one(&self) {
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.condvar.notify_one();
        }
    }

    pub fn notify_all(&self) {
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.condvar.notify_all();
        }
    }

    /// Sleeps for at most `timeout` unless `still_idle` says otherwise once
    /// the sleeper is registered.
    fn sleep(&self, timeout: Duration, still_idle: impl FnOnce() -> bool) {
        let mut guard = self.lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        if still_idle() {
            self.condvar.wait_for(&mut guard, timeout);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Idle {
    backoff: Backoff,
}

impl Idle {
    fn new() -> Self {
        Idle {
            backoff: Backoff::new(),
        }
    }

    fn reset(&mut self) {
        self.backoff.reset();
    }

    /// Spins, then yields the thread, then (if configured) sleeps until
    /// woken or the park timeout elapses.
    fn snooze(&mut self, shared: &Shared, worker: &WorkerState) {
        if !self.backoff.is_completed() {
            self.backoff.snooze();
            return;
        }

        let idle = &shared.config.idle;
        if !idle.park {
            thread::yield_now();
            return;
        }

        #[cfg(feature = "metrics")]
        shared.metrics.idle_parks.fetch_add(1, Ordering::Relaxed);

        shared
            .idle
            .sleep(Duration::from_micros(idle.park_timeout_us), || {
                !shared.has_runnable() && !worker.is_released() && !worker.may_retire(shared)
            });
    }
}

/// Starts worker thread `id`, optionally pinned to `core`.
pub(crate) fn spawn(
    id: usize,
    shared: Arc<Shared>,
    core: Option<core_affinity::CoreId>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("fibersched-worker-{id}"))
        .spawn(move || {
            if let Some(core) = core {
                if !core_affinity::set_for_current(core) {
                    log::warn!("worker {} could not be pinned to core {}", id, core.id);
                }
            }

            log::debug!("worker {} started", id);
            let worker = WorkerState::spawned(id);
            dispatch(&shared, &worker);
            log::debug!("worker {} stopped", id);
        })
}
