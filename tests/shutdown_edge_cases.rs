use fibersched::{Context, Counter, JobPriority, Scheduler, SchedulerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_shutdown_during_job_execution() {
    init_logging();
    let scheduler = Scheduler::new(2).unwrap();
    let executed = Arc::new(AtomicUsize::new(0));

    let works = (0..10).map(|_| {
        let executed = executed.clone();
        move |_: &Context<'_>| {
            std::thread::sleep(Duration::from_millis(10));
            executed.fetch_add(1, Ordering::SeqCst);
        }
    });
    let counter = scheduler.run_batch(JobPriority::Normal, works).unwrap();

    // Shut down without waiting: queued jobs are drained first.
    let result = scheduler.shutdown();
    assert!(result.is_ok(), "Shutdown should succeed after jobs complete");
    assert_eq!(executed.load(Ordering::SeqCst), 10);
    assert!(counter.is_complete());
}

#[test]
fn test_shutdown_idle_scheduler() {
    init_logging();
    for park in [true, false] {
        let mut config = SchedulerConfig {
            worker_threads: Some(4),
            ..SchedulerConfig::default()
        };
        config.idle.park = park;
        let scheduler = Scheduler::with_config(config).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        scheduler.shutdown().unwrap();
    }
}

#[test]
fn test_shutdown_resumes_satisfied_waiters() {
    init_logging();
    let scheduler = Scheduler::new(2).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    let works = (0..8).map(|_| {
        let finished = finished.clone();
        move |ctx: &Context<'_>| {
            let child = ctx
                .run(JobPriority::Low, |_| std::thread::sleep(Duration::from_millis(2)))
                .unwrap();
            ctx.wait_for(&child);
            finished.fetch_add(1, Ordering::SeqCst);
        }
    });
    scheduler.run_batch(JobPriority::Normal, works).unwrap();

    scheduler.shutdown().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 8);
}

#[test]
fn test_shutdown_with_unsatisfiable_waiter() {
    init_logging();
    let scheduler = Scheduler::new(1).unwrap();
    let never = Counter::new(1);
    let started = Counter::new(1);

    let never_clone = never.clone();
    let started_clone = started.clone();
    scheduler
        .run(JobPriority::Normal, move |ctx| {
            started_clone.decrement();
            ctx.wait_for(&never_clone);
            unreachable!("the counter never reaches zero");
        })
        .unwrap();

    while !started.is_complete() {
        std::thread::sleep(Duration::from_millis(1));
    }
    // Give the fiber time to park.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(scheduler.census().waiting, 1);

    // The parked fiber is leaked rather than resumed or unwound.
    scheduler.shutdown().unwrap();
    assert_eq!(never.value(), 1);
}

#[test]
fn test_drop_without_shutdown() {
    init_logging();
    let executed = Arc::new(AtomicUsize::new(0));
    {
        let scheduler = Scheduler::new(2).unwrap();
        let executed = executed.clone();
        scheduler
            .run(JobPriority::Low, move |_| {
                executed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    assert_eq!(executed.load(Ordering::SeqCst), 1);
}
