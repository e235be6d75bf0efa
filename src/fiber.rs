//! Fiber contexts and fiber slots.
//!
//! [`FiberContext`] is the only place where execution switches stacks. It is a
//! saved register snapshot plus a guarded stack, backed by a `corosensei`
//! coroutine, and it exposes exactly two moves:
//!
//! - [`FiberContext::resume`] restores a saved fiber and runs it until it
//!   suspends again.
//! - [`Suspender::suspend`] saves the running fiber and returns control to
//!   whoever resumed it, carrying a value.
//!
//! Everything above this module is architecture-agnostic. The scheduler's
//! fiber-to-fiber swap is built from the two: the outgoing fiber suspends with
//! a [`Handoff::Switch`] naming the incoming fiber, and the worker's
//! dispatcher, running on the thread's own stack, parks the outgoing fiber and
//! resumes the incoming one. A fiber is therefore never visible on a list
//! while its registers are still live on some CPU.

use crate::allocator::FiberStack;
use crate::counter::Counter;
use crate::error::fatal;
use crate::worker::WorkerRef;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Handle a running fiber uses to save itself and yield control.
#[repr(transparent)]
pub struct Suspender<I, Y> {
    yielder: Yielder<I, Y>,
}

impl<I, Y> Suspender<I, Y> {
    fn from_yielder(yielder: &Yielder<I, Y>) -> &Self {
        // SAFETY: Suspender is a transparent wrapper around Yielder.
        unsafe { &*(yielder as *const Yielder<I, Y> as *const Self) }
    }

    /// Saves the current fiber and hands `value` to the code that resumed it.
    ///
    /// Returns the input passed to the [`FiberContext::resume`] call that
    /// restores this fiber, possibly on another OS thread.
    pub fn suspend(&self, value: Y) -> I {
        self.yielder.suspend(value)
    }
}

/// A suspended (or not yet started) execution with its own stack.
///
/// `I` is what a resume passes in, `Y` is what a suspend passes out.
pub struct FiberContext<I, Y> {
    coroutine: Coroutine<I, Y, (), FiberStack>,
    stack: FiberStack,
}

impl<I: 'static, Y: 'static> FiberContext<I, Y> {
    /// Seeds a context on `stack`. The first resume calls
    /// `entry(suspender, input)` as if it were a plain function call.
    pub fn new<F>(stack: FiberStack, entry: F) -> Self
    where
        F: FnOnce(&Suspender<I, Y>, I) + 'static,
    {
        let coroutine = Coroutine::with_stack(stack, move |yielder: &Yielder<I, Y>, input: I| {
            entry(Suspender::from_yielder(yielder), input)
        });
        FiberContext { coroutine, stack }
    }
}

impl<I, Y> FiberContext<I, Y> {
    /// Restores the fiber and runs it until it next suspends.
    ///
    /// Returns `None` once the entry function has returned; a finished
    /// context stays finished.
    pub fn resume(&mut self, input: I) -> Option<Y> {
        if self.coroutine.done() {
            return None;
        }
        match self.coroutine.resume(input) {
            CoroutineResult::Yield(value) => Some(value),
            CoroutineResult::Return(()) => None,
        }
    }

    /// True once the entry function has returned.
    pub fn is_finished(&self) -> bool {
        self.coroutine.done()
    }

    pub fn stack(&self) -> FiberStack {
        self.stack
    }
}

/// Index of a fiber in the scheduler's fiber arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(crate) u32);

impl FiberId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Input of every resume of a scheduler fiber.
pub(crate) enum Resume {
    /// Continue running on behalf of the given worker.
    Run(WorkerRef),
    /// Return from the entry function so the context can be dropped.
    Terminate,
}

/// What a suspending fiber asks its worker's dispatcher to do.
pub(crate) enum Handoff {
    /// Park the outgoing fiber as described and restore `next`.
    Switch { next: FiberId, park: Park },
    /// Park the outgoing fiber on the free list and leave the dispatcher.
    Exit,
}

/// Where an outgoing fiber goes once it is fully saved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Park {
    Free,
    Wait,
}

pub(crate) type SchedContext = FiberContext<Resume, Handoff>;
pub(crate) type SchedSuspender = Suspender<Resume, Handoff>;

/// The counter value a parked fiber waits for.
pub(crate) struct WaitTarget {
    pub counter: Counter,
    pub expected: usize,
}

impl WaitTarget {
    pub fn is_satisfied(&self) -> bool {
        self.counter.value() == self.expected
    }
}

/// Which single owner currently holds a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Never handed out; has no context yet.
    Unborn = 0,
    /// Held by a worker, either executing or about to be restored.
    Running = 1,
    /// On the free list.
    Free = 2,
    /// On the wait list.
    Waiting = 3,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FiberState::Unborn,
            1 => FiberState::Running,
            2 => FiberState::Free,
            _ => FiberState::Waiting,
        }
    }
}

/// One slot of the fiber arena.
///
/// `context` and `wait` are only touched by the fiber's current owner; the
/// ownership tag records who that is and every hand-over is checked against it.
pub(crate) struct Fiber {
    id: FiberId,
    state: AtomicU8,
    context: UnsafeCell<Option<SchedContext>>,
    wait: UnsafeCell<Option<WaitTarget>>,
}

// SAFETY: the UnsafeCells are accessed only by the single owner recorded in
// `state`; ownership moves between threads under the list spinlocks.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    pub fn new(id: FiberId) -> Self {
        Fiber {
            id,
            state: AtomicU8::new(FiberState::Unborn as u8),
            context: UnsafeCell::new(None),
            wait: UnsafeCell::new(None),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves ownership from `from` to `to`, aborting if the fiber was not
    /// where the caller believed it to be.
    pub fn transition(&self, from: FiberState, to: FiberState) {
        if let Err(actual) = self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            fatal!(
                "fiber {} ownership corrupted: expected {:?}, found {:?}",
                self.id,
                from,
                FiberState::from_u8(actual)
            );
        }
    }

    /// # Safety
    ///
    /// The caller must own the fiber.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn context_mut(&self) -> &mut Option<SchedContext> {
        unsafe { &mut *self.context.get() }
    }

    /// # Safety
    ///
    /// The caller must own the fiber.
    pub unsafe fn set_wait(&self, target: WaitTarget) {
        unsafe { *self.wait.get() = Some(target) };
    }

    /// # Safety
    ///
    /// The caller must own the fiber or hold the wait-list lock while the
    /// fiber is on the wait list.
    pub unsafe fn wait_target(&self) -> Option<&WaitTarget> {
        unsafe { (*self.wait.get()).as_ref() }
    }

    /// # Safety
    ///
    /// Same as [`Fiber::wait_target`].
    pub unsafe fn take_wait(&self) -> Option<WaitTarget> {
        unsafe { (*self.wait.get()).take() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::StackAllocator;

    #[test]
    fn test_context_round_trips_values() {
        let stacks = StackAllocator::new(1, 64 * 1024).unwrap();
        let mut context = FiberContext::new(stacks.alloc().unwrap(), |suspender, first: u32| {
            let mut total = first;
            loop {
                let next = suspender.suspend(total);
                if next == 0 {
                    return;
                }
                total += next;
            }
        });

        assert_eq!(context.resume(1), Some(1));
        assert_eq!(context.resume(2), Some(3));
        assert_eq!(context.resume(4), Some(7));
        assert_eq!(context.resume(0), None);
        assert!(context.is_finished());
        assert_eq!(context.resume(5), None);

        assert!(stacks.check_redzone(&context.stack()));
    }

    #[test]
    fn test_context_resumes_on_another_thread() {
        let stacks = StackAllocator::new(1, 64 * 1024).unwrap();
        let mut context = FiberContext::new(stacks.alloc().unwrap(), |suspender, _: ()| {
            let before = std::thread::current().id();
            suspender.suspend(format!("{before:?}"));
            let after = std::thread::current().id();
            suspender.suspend(format!("{after:?}"));
        });

        struct SendContext(FiberContext<(), String>);
        unsafe impl Send for SendContext {}

        let main_id = format!("{:?}", std::thread::current().id());
        assert_eq!(context.resume(()), Some(main_id.clone()));

        let moved = SendContext(context);
        let other_id = std::thread::spawn(move || {
            let mut moved = moved;
            let seen = moved.0.resume(()).unwrap();
            assert_eq!(moved.0.resume(()), None);
            (seen, format!("{:?}", std::thread::current().id()))
        })
        .join()
        .unwrap();

        assert_eq!(other_id.0, other_id.1);
        assert_ne!(other_id.0, main_id);
    }

    #[test]
    fn test_transition_tracks_owner() {
        let fiber = Fiber::new(FiberId(3));
        assert_eq!(fiber.state(), FiberState::Unborn);
        fiber.transition(FiberState::Unborn, FiberState::Running);
        fiber.transition(FiberState::Running, FiberState::Waiting);
        assert_eq!(fiber.state(), FiberState::Waiting);
        assert_eq!(fiber.id().to_string(), "#3");
    }
}
