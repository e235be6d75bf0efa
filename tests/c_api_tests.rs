use fibersched::Scheduler;
use fibersched::c_api::*;
use fibersched::counter::Counter;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

unsafe extern "C" fn add_one(_scheduler: *const Scheduler, data: *mut c_void) {
    let total = unsafe { &*(data as *const AtomicUsize) };
    total.fetch_add(1, Ordering::SeqCst);
}

struct Fanout {
    total: AtomicUsize,
    children: usize,
}

unsafe extern "C" fn spawn_children(scheduler: *const Scheduler, data: *mut c_void) {
    let fanout = unsafe { &*(data as *const Fanout) };
    let jobs: Vec<CJob> = (0..fanout.children)
        .map(|_| CJob {
            callback: add_one,
            data: &fanout.total as *const AtomicUsize as *mut c_void,
        })
        .collect();

    unsafe {
        let counter = scheduler_counter_new(jobs.len());
        let queued = scheduler_run_jobs(
            scheduler,
            CJobPriority::High,
            jobs.as_ptr(),
            jobs.len(),
            counter,
        );
        assert_eq!(queued, jobs.len());
        scheduler_await(scheduler, counter, 0);
        assert_eq!(scheduler_counter_value(counter), 0);
        scheduler_counter_free(counter);
    }
    fanout.total.fetch_add(100, Ordering::SeqCst);
}

#[test]
fn test_init_run_await_free() {
    let mut scheduler: *mut Scheduler = ptr::null_mut();
    assert_eq!(unsafe { scheduler_init(&mut scheduler) }, 0);
    assert!(!scheduler.is_null());

    let total = AtomicUsize::new(0);
    let jobs: Vec<CJob> = (0..50)
        .map(|_| CJob {
            callback: add_one,
            data: &total as *const AtomicUsize as *mut c_void,
        })
        .collect();

    unsafe {
        let counter = scheduler_counter_new(jobs.len());
        let queued = scheduler_run_jobs(
            scheduler,
            CJobPriority::Normal,
            jobs.as_ptr(),
            jobs.len(),
            counter,
        );
        assert_eq!(queued, 50);
        scheduler_await(scheduler, counter, 0);
        assert_eq!(scheduler_counter_value(counter), 0);
        scheduler_counter_free(counter);

        scheduler_free(&mut scheduler);
    }

    assert!(scheduler.is_null());
    assert_eq!(total.load(Ordering::SeqCst), 50);
}

#[test]
fn test_callbacks_can_submit_and_await() {
    let mut scheduler: *mut Scheduler = ptr::null_mut();
    assert_eq!(unsafe { scheduler_init(&mut scheduler) }, 0);

    let fanouts: Vec<Fanout> = (0..8)
        .map(|_| Fanout {
            total: AtomicUsize::new(0),
            children: 5,
        })
        .collect();
    let jobs: Vec<CJob> = fanouts
        .iter()
        .map(|fanout| CJob {
            callback: spawn_children,
            data: fanout as *const Fanout as *mut c_void,
        })
        .collect();

    unsafe {
        let counter = scheduler_counter_new(jobs.len());
        scheduler_run_jobs(scheduler, CJobPriority::Low, jobs.as_ptr(), jobs.len(), counter);
        scheduler_await(scheduler, counter, 0);
        scheduler_counter_free(counter);
        scheduler_free(&mut scheduler);
    }

    for fanout in &fanouts {
        assert_eq!(fanout.total.load(Ordering::SeqCst), 105);
    }
}

#[test]
fn test_await_partial_value() {
    let mut scheduler: *mut Scheduler = ptr::null_mut();
    assert_eq!(unsafe { scheduler_init(&mut scheduler) }, 0);

    let total = AtomicUsize::new(0);
    let jobs: Vec<CJob> = (0..3)
        .map(|_| CJob {
            callback: add_one,
            data: &total as *const AtomicUsize as *mut c_void,
        })
        .collect();

    unsafe {
        // Two more than the jobs submitted, so the counter settles at 2.
        let counter = scheduler_counter_new(5);
        scheduler_run_jobs(scheduler, CJobPriority::Normal, jobs.as_ptr(), jobs.len(), counter);
        scheduler_await(scheduler, counter, 2);
        assert_eq!(scheduler_counter_value(counter), 2);
        scheduler_counter_free(counter);
        scheduler_free(&mut scheduler);
    }
    assert_eq!(total.load(Ordering::SeqCst), 3);
}

#[test]
fn test_null_handles_are_ignored() {
    unsafe {
        assert_eq!(scheduler_init(ptr::null_mut()), -1);

        let mut scheduler: *mut Scheduler = ptr::null_mut();
        scheduler_free(&mut scheduler);
        scheduler_free(ptr::null_mut());

        assert_eq!(
            scheduler_run_jobs(ptr::null(), CJobPriority::Normal, ptr::null(), 0, ptr::null()),
            0
        );
        scheduler_await(ptr::null(), ptr::null(), 0);
        assert_eq!(scheduler_counter_value(ptr::null()), 0);
        scheduler_counter_free(ptr::null_mut());
    }
}

#[test]
fn test_counter_outlives_free_handle() {
    let counter = scheduler_counter_new(1);
    let shared: Counter = unsafe { (*counter).clone() };
    unsafe { scheduler_counter_free(counter) };
    assert_eq!(shared.value(), 1);
    assert!(shared.decrement());
}
