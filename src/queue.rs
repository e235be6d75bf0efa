//! Bounded lock-free multi-producer/multi-consumer job queue.
//!
//! The queue is a power-of-two ring of slots. Every slot carries a tagged
//! state word that is only ever changed with a compare-and-swap over the
//! whole word:
//!
//! ```text
//! Empty{lap} -> Reserved{lap} -> Occupied{lap} -> Tombstone{lap} -> Empty{lap + 1}
//!   producer claims   value written    consumer claims   value taken
//! ```
//!
//! `lap` is the round of the ring the slot belongs to (`position / capacity`).
//! It plays the part of the alternating null values of the classic
//! Tsigas-Zhang queue: a slot vacated in an earlier round can never be
//! mistaken for one that is free in the current round, so a stalled thread
//! holding an old index fails its CAS instead of corrupting the slot.
//!
//! `head` and `tail` are monotonically advancing positions. The thread that
//! claims a slot advances the index with a best-effort CAS; any thread that
//! finds the slot under the index already claimed helps advance it, so a
//! preempted claimer cannot stall the queue. One slot is kept in reserve:
//! at most `capacity - 1` values are live at once.

use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

const TAG_BITS: u32 = 2;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Decoded state of one ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    /// Free for the producer of `lap`.
    Empty { lap: u64 },
    /// A producer of `lap` owns the slot and is writing its value.
    Reserved { lap: u64 },
    /// Holds a value published in `lap`.
    Occupied { lap: u64 },
    /// A consumer of `lap` owns the slot and is moving the value out.
    Tombstone { lap: u64 },
}

impl Slot {
    #[inline]
    fn pack(self) -> u64 {
        match self {
            Slot::Empty { lap } => lap << TAG_BITS,
            Slot::Reserved { lap } => (lap << TAG_BITS) | 1,
            Slot::Occupied { lap } => (lap << TAG_BITS) | 2,
            Slot::Tombstone { lap } => (lap << TAG_BITS) | 3,
        }
    }

    #[inline]
    fn unpack(word: u64) -> Self {
        let lap = word >> TAG_BITS;
        match word & TAG_MASK {
            0 => Slot::Empty { lap },
            1 => Slot::Reserved { lap },
            2 => Slot::Occupied { lap },
            _ => Slot::Tombstone { lap },
        }
    }

    #[inline]
    fn lap(self) -> u64 {
        match self {
            Slot::Empty { lap }
            | Slot::Reserved { lap }
            | Slot::Occupied { lap }
            | Slot::Tombstone { lap } => lap,
        }
    }
}

struct Cell<T> {
    state: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A fixed-capacity lock-free FIFO-ish queue.
///
/// Ordering is FIFO for a single producer and a single consumer. Under
/// concurrent producers the relative order of their values is unspecified.
pub struct JobQueue<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    cells: Box<[Cell<T>]>,
    mask: u64,
    lap_shift: u32,
}

// SAFETY: values move between threads through the slot protocol; a value is
// only touched by the single thread that won the CAS on its slot.
unsafe impl<T: Send> Send for JobQueue<T> {}
unsafe impl<T: Send> Sync for JobQueue<T> {}

impl<T> JobQueue<T> {
    /// Creates a queue with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two or is smaller than 2.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "job queue capacity must be a power of two >= 2, got {capacity}"
        );

        let cells = (0..capacity)
            .map(|_| Cell {
                state: AtomicU64::new(Slot::Empty { lap: 0 }.pack()),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        JobQueue {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            cells,
            mask: capacity as u64 - 1,
            lap_shift: capacity.trailing_zeros(),
        }
    }

    /// Number of slots in the ring. One of them is always kept free.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    fn cell(&self, position: u64) -> &Cell<T> {
        &self.cells[(position & self.mask) as usize]
    }

    #[inline]
    fn lap_of(&self, position: u64) -> u64 {
        position >> self.lap_shift
    }

    /// Enqueues `value`, handing it back if the queue was observed full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let backoff = Backoff::new();
        let usable = self.capacity() as u64 - 1;
        let mut tail = self.tail.load(Ordering::Acquire);

        loop {
            let head = self.head.load(Ordering::Acquire);
            if tail >= head && tail - head >= usable {
                return Err(value);
            }

            let lap = self.lap_of(tail);
            let cell = self.cell(tail);
            let word = cell.state.load(Ordering::Acquire);

            match Slot::unpack(word) {
                Slot::Empty { lap: slot_lap } if slot_lap == lap => {
                    let claimed = cell.state.compare_exchange_weak(
                        word,
                        Slot::Reserved { lap }.pack(),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    if claimed.is_ok() {
                        let _ = self.tail.compare_exchange(
                            tail,
                            tail + 1,
                            Ordering::Release,
                            Ordering::Relaxed,
                        );
                        // SAFETY: the Reserved state grants exclusive access.
                        unsafe { (*cell.value.get()).write(value) };
                        cell.state
                            .store(Slot::Occupied { lap }.pack(), Ordering::Release);
                        return Ok(());
                    }
                    backoff.spin();
                }
                // A consumer of the previous round is still moving its value
                // out. The ring is not full (checked above), so wait for it.
                slot if slot.lap() < lap => backoff.snooze(),
                // Already claimed in this round: help the claimer move the tail.
                _ => {
                    let _ = self.tail.compare_exchange(
                        tail,
                        tail + 1,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                }
            }

            tail = self.tail.load(Ordering::Acquire);
        }
    }

    /// Dequeues the oldest published value, or `None` if none was observed.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let lap = self.lap_of(head);
            let cell = self.cell(head);
            let word = cell.state.load(Ordering::Acquire);

            match Slot::unpack(word) {
                Slot::Occupied { lap: slot_lap } if slot_lap == lap => {
                    let claimed = cell.state.compare_exchange_weak(
                        word,
                        Slot::Tombstone { lap }.pack(),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    if claimed.is_ok() {
                        let _ = self.head.compare_exchange(
                            head,
                            head + 1,
                            Ordering::Release,
                            Ordering::Relaxed,
                        );
                        // SAFETY: the Tombstone state grants exclusive access
                        // and the producer published the value with Release.
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.state
                            .store(Slot::Empty { lap: lap + 1 }.pack(), Ordering::Release);
                        return Some(value);
                    }
                    backoff.spin();
                }
                // Nothing published at the head position yet.
                Slot::Empty { lap: slot_lap } | Slot::Reserved { lap: slot_lap }
                    if slot_lap == lap =>
                {
                    return None;
                }
                slot if slot.lap() < lap => return None,
                // Already consumed in this round: help move the head.
                _ => {
                    let _ = self.head.compare_exchange(
                        head,
                        head + 1,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                }
            }

            head = self.head.load(Ordering::Acquire);
        }
    }

    /// Approximate number of queued values.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for JobQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_slot_encoding() {
        for slot in [
            Slot::Empty { lap: 0 },
            Slot::Reserved { lap: 7 },
            Slot::Occupied { lap: 1 << 40 },
            Slot::Tombstone { lap: 3 },
        ] {
            assert_eq!(Slot::unpack(slot.pack()), slot);
        }
        assert_eq!(Slot::Empty { lap: 0 }.pack(), 0);
    }

    #[test]
    fn test_fifo_single_thread() {
        let queue = JobQueue::with_capacity(8);
        assert!(queue.pop().is_none());

        for i in 0..5 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 5);

        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_reserves_one_slot() {
        let queue = JobQueue::with_capacity(16);
        for i in 0..15 {
            assert!(queue.push(i).is_ok(), "push {i} should fit");
        }
        assert_eq!(queue.push(99), Err(99));

        assert_eq!(queue.pop(), Some(0));
        assert!(queue.push(15).is_ok());
        assert_eq!(queue.push(100), Err(100));
    }

    #[test]
    fn test_push_waits_for_slow_consumer_of_previous_lap() {
        let queue = Arc::new(JobQueue::with_capacity(4));
        queue.push(0).unwrap();

        // Claim position 0 the way `pop` does and stop before the slot is
        // handed to the next lap.
        let cell = queue.cell(0);
        cell.state
            .compare_exchange(
                Slot::Occupied { lap: 0 }.pack(),
                Slot::Tombstone { lap: 0 }.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .unwrap();
        queue.head.store(1, Ordering::Release);
        let first = unsafe { (*cell.value.get()).assume_init_read() };
        assert_eq!(first, 0);

        for i in 1..4 {
            queue.push(i).unwrap();
        }
        for i in 1..4 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert!(queue.is_empty());

        let finisher = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(20));
                queue
                    .cell(0)
                    .state
                    .store(Slot::Empty { lap: 1 }.pack(), Ordering::Release);
            })
        };

        // The ring is empty, so the push must not report it full.
        assert_eq!(queue.push(99), Ok(()));
        finisher.join().unwrap();
        assert_eq!(queue.pop(), Some(99));
    }

    #[test]
    fn test_wraps_across_many_laps() {
        let queue = JobQueue::with_capacity(4);
        for round in 0..1000 {
            queue.push(round * 2).unwrap();
            queue.push(round * 2 + 1).unwrap();
            assert_eq!(queue.pop(), Some(round * 2));
            assert_eq!(queue.pop(), Some(round * 2 + 1));
        }
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_rejects_non_power_of_two() {
        let _ = JobQueue::<u32>::with_capacity(12);
    }

    #[test]
    fn test_drop_releases_queued_values() {
        let live = Arc::new(AtomicUsize::new(0));

        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }

        {
            let queue = JobQueue::with_capacity(8);
            for _ in 0..6 {
                live.fetch_add(1, Ordering::SeqCst);
                assert!(queue.push(Tracked(live.clone())).is_ok());
            }
            drop(queue.pop());
        }

        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_no_loss_no_duplication() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 20_000;

        let queue = Arc::new(JobQueue::with_capacity(64));
        let consumed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut value = p * PER_PRODUCER + i;
                        while let Err(rejected) = queue.push(value) {
                            value = rejected;
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while consumed.load(Ordering::SeqCst) < PRODUCERS * PER_PRODUCER {
                        match queue.pop() {
                            Some(value) => {
                                seen.push(value);
                                consumed.fetch_add(1, Ordering::SeqCst);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut all = HashSet::new();
        let mut total = 0;
        for consumer in consumers {
            for value in consumer.join().unwrap() {
                assert!(all.insert(value), "value {value} popped twice");
                total += 1;
            }
        }

        assert_eq!(total, PRODUCERS * PER_PRODUCER);
        assert!(queue.pop().is_none());
    }
}
