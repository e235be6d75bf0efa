//! The scheduler's fiber arena with its free and wait lists.
//!
//! Fibers live in one flat array for the life of the scheduler and are named
//! by index. A fiber is handed out at most once by the bump index; after that
//! it circulates between workers, the free list and the wait list, and the
//! ownership tag on each slot checks that it is held by exactly one of them.

use crate::fiber::{Fiber, FiberId, FiberState, Park, SchedContext};
use crate::spinlock::SpinLock;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time count of where the pool's fibers are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FiberCensus {
    /// Fibers held by a worker.
    pub running: usize,
    /// Fibers on the free list.
    pub free: usize,
    /// Fibers parked on the wait list.
    pub waiting: usize,
    /// Fibers handed out by the bump index so far.
    pub created: usize,
    /// Pool capacity.
    pub capacity: usize,
    /// Number of fibers found on more than one list, or on a list that
    /// disagrees with their ownership tag. Always zero in a healthy pool.
    pub conflicts: usize,
}

impl FiberCensus {
    /// True if every created fiber was found with exactly one owner.
    pub fn is_consistent(&self) -> bool {
        self.conflicts == 0 && self.running + self.free + self.waiting == self.created
    }
}

pub(crate) struct FiberPool {
    fibers: Box<[Fiber]>,
    next_unborn: SpinLock<usize>,
    free: SpinLock<Vec<FiberId>>,
    waiting: SpinLock<Vec<FiberId>>,
    // Mirrors `waiting.len()` so idle scans can skip the lock.
    parked: AtomicUsize,
}

impl FiberPool {
    pub fn new(capacity: usize) -> Self {
        let fibers = (0..capacity)
            .map(|index| Fiber::new(FiberId(index as u32)))
            .collect();
        FiberPool {
            fibers,
            next_unborn: SpinLock::new(0),
            // Neither list can outgrow the pool, so pushes never reallocate
            // while the lock is held.
            free: SpinLock::new(Vec::with_capacity(capacity)),
            waiting: SpinLock::new(Vec::with_capacity(capacity)),
            parked: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, id: FiberId) -> &Fiber {
        &self.fibers[id.index()]
    }

    pub fn capacity(&self) -> usize {
        self.fibers.len()
    }

    /// Hands out a never-used fiber to the caller, who must install its
    /// context before resuming it.
    pub fn bump(&self) -> Option<FiberId> {
        let mut next = self.next_unborn.lock();
        if *next == self.fibers.len() {
            return None;
        }
        let id = FiberId(*next as u32);
        self.get(id).transition(FiberState::Unborn, FiberState::Running);
        *next += 1;
        Some(id)
    }

    /// Takes a fiber off the free list.
    pub fn pop_free(&self) -> Option<FiberId> {
        let mut free = self.free.lock();
        let id = free.pop()?;
        self.get(id).transition(FiberState::Free, FiberState::Running);
        Some(id)
    }

    /// Hands a fully saved fiber over to the free or wait list.
    pub fn park(&self, id: FiberId, park: Park) {
        let fiber = self.get(id);
        match park {
            Park::Free => {
                let mut free = self.free.lock();
                fiber.transition(FiberState::Running, FiberState::Free);
                free.push(id);
            }
            Park::Wait => {
                let mut waiting = self.waiting.lock();
                fiber.transition(FiberState::Running, FiberState::Waiting);
                waiting.push(id);
                self.parked.fetch_add(1, Ordering::Release);
            }
        }
    }

    /// Removes the longest-waiting fiber whose counter has reached its
    /// target and gives it to the caller.
    pub fn take_satisfied(&self) -> Option<FiberId> {
        if self.parked.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut waiting = self.waiting.lock();
        let position = waiting.iter().position(|&id| {
            // SAFETY: the wait-list lock is held and the fiber is on the list.
            unsafe { self.get(id).wait_target() }.is_some_and(|target| target.is_satisfied())
        })?;
        let id = waiting.remove(position);
        self.parked.fetch_sub(1, Ordering::Release);
        let fiber = self.get(id);
        // SAFETY: as above; the fiber leaves the list under the same lock.
        unsafe { fiber.take_wait() };
        fiber.transition(FiberState::Waiting, FiberState::Running);
        Some(id)
    }

    /// True if some parked fiber could be resumed right now.
    pub fn has_satisfied(&self) -> bool {
        if self.parked.load(Ordering::Acquire) == 0 {
            return false;
        }
        let waiting = self.waiting.lock();
        waiting.iter().any(|&id| {
            // SAFETY: the wait-list lock is held and the fiber is on the list.
            unsafe { self.get(id).wait_target() }.is_some_and(|target| target.is_satisfied())
        })
    }

    pub fn waiting_len(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    /// Samples fiber ownership.
    ///
    /// Both lists are locked together so no fiber can move between them while
    /// they are read; a fiber is counted as running when its tag says so and
    /// it is on neither list.
    pub fn census(&self) -> FiberCensus {
        let free = self.free.lock();
        let waiting = self.waiting.lock();
        let created = *self.next_unborn.lock();

        let mut seen = vec![0u8; self.fibers.len()];
        let mut conflicts = 0;
        for (&id, expected) in free
            .iter()
            .map(|id| (id, FiberState::Free))
            .chain(waiting.iter().map(|id| (id, FiberState::Waiting)))
        {
            seen[id.index()] += 1;
            if seen[id.index()] > 1 || self.get(id).state() != expected {
                conflicts += 1;
            }
        }

        let mut running = 0;
        for fiber in &self.fibers[..created] {
            if seen[fiber.id().index()] == 0 {
                match fiber.state() {
                    FiberState::Running => running += 1,
                    _ => conflicts += 1,
                }
            }
        }

        FiberCensus {
            running,
            free: free.len(),
            waiting: waiting.len(),
            created,
            capacity: self.fibers.len(),
            conflicts,
        }
    }

    /// Tears down every fiber once no worker is left.
    ///
    /// Every free fiber's context is handed to `release`, which finishes it
    /// and returns its stack. Any other fiber is suspended in the middle of a
    /// job (parked on a counter that never matched, or abandoned by a worker
    /// that panicked); unwinding it would run the job's remaining code, so its
    /// context is leaked instead. Returns the number of leaked fibers.
    pub fn teardown(&mut self, mut release: impl FnMut(SchedContext)) -> usize {
        self.free.get_mut().clear();
        self.waiting.get_mut().clear();
        *self.parked.get_mut() = 0;

        let mut leaked = 0;
        for fiber in self.fibers.iter() {
            // SAFETY: `&mut self` proves no worker holds a fiber.
            let Some(context) = (unsafe { fiber.context_mut() }).take() else {
                continue;
            };
            if fiber.state() == FiberState::Free {
                release(context);
            } else {
                mem::forget(context);
                leaked += 1;
            }
        }
        leaked
    }
}
