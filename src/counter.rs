//! Completion counters shared between job submitters, jobs and waiters.

use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A thread-safe counter for tracking job completion.
///
/// Submitting `n` jobs against a counter initialized to `n` makes it reach
/// zero once every job has run. Any fiber can park until the counter equals
/// an arbitrary value with [`Scheduler::await_counter`].
///
/// Cloning is cheap and every clone observes the same value.
///
/// [`Scheduler::await_counter`]: crate::Scheduler::await_counter
#[derive(Clone)]
pub struct Counter {
    value: Arc<CachePadded<AtomicUsize>>,
}

impl Counter {
    /// Creates a new counter with the specified initial value.
    pub fn new(initial: usize) -> Self {
        Counter {
            value: Arc::new(CachePadded::new(AtomicUsize::new(initial))),
        }
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::AcqRel);
    }

    /// Adds `n` to the counter, e.g. before submitting `n` more jobs.
    pub fn add(&self, n: usize) {
        self.value.fetch_add(n, Ordering::AcqRel);
    }

    /// Decrements the counter by one.
    ///
    /// Returns true if the counter reached zero. Release ordering makes all
    /// work done before the decrement visible to whoever observes the new value.
    pub fn decrement(&self) -> bool {
        let previous = self.value.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "counter decremented below zero");
        previous == 1
    }

    /// Overwrites the counter.
    pub fn store(&self, value: usize) {
        self.value.store(value, Ordering::Release);
    }

    /// Returns the current value of the counter.
    pub fn value(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }

    /// Returns true if both handles refer to the same counter.
    pub fn ptr_eq(&self, other: &Counter) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.value()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new(5);
        assert_eq!(counter.value(), 5);
        assert!(!counter.is_complete());

        counter.decrement();
        assert_eq!(counter.value(), 4);

        counter.increment();
        assert_eq!(counter.value(), 5);

        counter.add(3);
        assert_eq!(counter.value(), 8);
    }

    #[test]
    fn test_counter_completion() {
        let counter = Counter::new(1);
        assert!(!counter.is_complete());

        assert!(counter.decrement());
        assert!(counter.is_complete());
    }

    #[test]
    fn test_clones_share_value() {
        let counter = Counter::new(2);
        let clone = counter.clone();
        assert!(counter.ptr_eq(&clone));
        assert!(!counter.ptr_eq(&Counter::new(2)));

        clone.store(7);
        assert_eq!(counter.value(), 7);
    }
}
