//! C-compatible surface of the scheduler.
//!
//! The scheduler and counters cross the boundary as opaque boxed pointers.
//! There is no global instance: every call takes the handle returned by
//! [`scheduler_init`], and job callbacks receive it back as their first
//! argument so they can submit and await from inside a fiber.

use crate::counter::Counter;
use crate::job::{Job, JobPriority};
use crate::scheduler::Scheduler;
use std::ffi::{c_int, c_void};
use std::ptr;

/// Job callback: `void callback(const Scheduler*, void* data)`.
pub type JobCallback = unsafe extern "C" fn(scheduler: *const Scheduler, data: *mut c_void);

/// A job as submitted from C. `data` must stay valid until the callback has
/// run.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CJob {
    pub callback: JobCallback,
    pub data: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CJobPriority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl From<CJobPriority> for JobPriority {
    fn from(priority: CJobPriority) -> Self {
        match priority {
            CJobPriority::High => JobPriority::High,
            CJobPriority::Normal => JobPriority::Normal,
            CJobPriority::Low => JobPriority::Low,
        }
    }
}

struct SendPtr<T>(*mut T);

// SAFETY: C callers promise the pointees may be used from any worker thread.
unsafe impl<T> Send for SendPtr<T> {}

/// Creates a scheduler with the default configuration and stores it in `*out`.
///
/// Returns 0 on success and -1 on failure (logged), leaving `*out` null.
///
/// # Safety
///
/// `out` must be valid for writes. The handle must be released with
/// [`scheduler_free`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn scheduler_init(out: *mut *mut Scheduler) -> c_int {
    if out.is_null() {
        return -1;
    }
    match Scheduler::init() {
        Ok(scheduler) => {
            unsafe { *out = Box::into_raw(Box::new(scheduler)) };
            0
        }
        Err(err) => {
            log::error!("scheduler_init failed: {}", err);
            unsafe { *out = ptr::null_mut() };
            -1
        }
    }
}

/// Shuts down and releases the scheduler in `*inout`, then nulls it.
///
/// Blocks until the worker threads have drained the queues and exited.
///
/// # Safety
///
/// `inout` must be valid for reads and writes, and `*inout` must be null or
/// a handle from [`scheduler_init`] that no other thread is using.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn scheduler_free(inout: *mut *mut Scheduler) {
    if inout.is_null() {
        return;
    }
    let handle = unsafe { ptr::replace(inout, ptr::null_mut()) };
    if handle.is_null() {
        return;
    }
    let scheduler = unsafe { Box::from_raw(handle) };
    if let Err(err) = scheduler.shutdown() {
        log::error!("scheduler_free: {}", err);
    }
}

/// Submits `count` jobs stamped with `counter`.
///
/// Returns the number of jobs queued. A value below `count` means the queue
/// was full: jobs from that index on were not queued and their callbacks
/// will not run, and the caller decides whether to resubmit them.
///
/// # Safety
///
/// `scheduler` and `counter` must be live handles, and `jobs` must point to
/// `count` valid `CJob`s.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn scheduler_run_jobs(
    scheduler: *const Scheduler,
    priority: CJobPriority,
    jobs: *const CJob,
    count: usize,
    counter: *const Counter,
) -> usize {
    if scheduler.is_null() || counter.is_null() || (jobs.is_null() && count > 0) {
        return 0;
    }
    let (scheduler, counter) = unsafe { (&*scheduler, &*counter) };
    let jobs: &[CJob] = if count == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(jobs, count) }
    };

    let handle = SendPtr(scheduler as *const Scheduler as *mut Scheduler);
    let wrapped = jobs.iter().map(|job| {
        let CJob { callback, data } = *job;
        let data = SendPtr(data);
        let scheduler = SendPtr(handle.0);
        Job::new(move |_| {
            let (scheduler, data) = (scheduler, data);
            unsafe { callback(scheduler.0, data.0) }
        })
    });

    match scheduler.run_jobs(priority.into(), wrapped, counter) {
        Ok(()) => count,
        Err(full) => full.submitted,
    }
}

/// Suspends the caller until `*counter == expected`.
///
/// # Safety
///
/// `scheduler` and `counter` must be live handles.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn scheduler_await(
    scheduler: *const Scheduler,
    counter: *const Counter,
    expected: usize,
) {
    if scheduler.is_null() || counter.is_null() {
        return;
    }
    unsafe { (*scheduler).await_counter(&*counter, expected) };
}

/// Allocates a counter with the given initial value.
#[unsafe(no_mangle)]
pub extern "C" fn scheduler_counter_new(initial: usize) -> *mut Counter {
    Box::into_raw(Box::new(Counter::new(initial)))
}

/// Releases a counter from [`scheduler_counter_new`].
///
/// Jobs already submitted against it keep their own reference, so it may be
/// freed before they run.
///
/// # Safety
///
/// `counter` must be null or a handle from [`scheduler_counter_new`] that is
/// not used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn scheduler_counter_free(counter: *mut Counter) {
    if !counter.is_null() {
        drop(unsafe { Box::from_raw(counter) });
    }
}

/// # Safety
///
/// `counter` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn scheduler_counter_value(counter: *const Counter) -> usize {
    if counter.is_null() {
        return 0;
    }
    unsafe { (*counter).value() }
}
