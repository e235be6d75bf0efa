use fibersched::{JobPriority, Scheduler};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_hierarchical_job_tree() {
    let scheduler = Scheduler::new(2).unwrap();
    let total_work = Arc::new(AtomicUsize::new(0));

    let work = total_work.clone();
    let counter = scheduler
        .run(JobPriority::Normal, move |ctx| {
            let mut child_counters = vec![];

            for _ in 0..3 {
                let work1 = work.clone();
                let child = ctx
                    .run(JobPriority::Normal, move |ctx| {
                        work1.fetch_add(1, Ordering::SeqCst);

                        let mut grandchild_counters = vec![];
                        for _ in 0..2 {
                            let work2 = work1.clone();
                            let grandchild = ctx
                                .run(JobPriority::High, move |_ctx| {
                                    work2.fetch_add(1, Ordering::SeqCst);
                                })
                                .unwrap();
                            grandchild_counters.push(grandchild);
                        }

                        for gc in grandchild_counters {
                            ctx.wait_for(&gc);
                        }
                    })
                    .unwrap();
                child_counters.push(child);
            }

            for c in child_counters {
                ctx.wait_for(&c);
            }
        })
        .unwrap();

    scheduler.wait_for(&counter);

    assert_eq!(total_work.load(Ordering::SeqCst), 9);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_deep_dependency_chain_single_worker() {
    // One spawned worker and a chain of jobs that each await the next: every
    // await must park a fiber rather than the thread, or the chain deadlocks.
    let scheduler = Scheduler::new(1).unwrap();
    let depth = 40;
    let reached = Arc::new(AtomicUsize::new(0));

    fn stage(ctx: &fibersched::Context<'_>, remaining: usize, reached: Arc<AtomicUsize>) {
        reached.fetch_add(1, Ordering::SeqCst);
        if remaining == 0 {
            return;
        }
        let next = reached.clone();
        let child = ctx
            .run(JobPriority::Normal, move |ctx| stage(ctx, remaining - 1, next))
            .unwrap();
        ctx.wait_for(&child);
    }

    let reached_clone = reached.clone();
    let counter = scheduler
        .run(JobPriority::Normal, move |ctx| stage(ctx, depth, reached_clone))
        .unwrap();

    // Poll so the spawned worker has to do everything itself.
    while !counter.is_complete() {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    assert_eq!(reached.load(Ordering::SeqCst), depth + 1);
    let census = scheduler.census();
    assert!(census.is_consistent());
    assert_eq!(census.waiting, 0);
    scheduler.shutdown().unwrap();
}
