use fibersched::{Context, Counter, Job, JobPriority, Scheduler, SchedulerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("fibersched - Cooperative Fiber Job Scheduler\n");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = match std::fs::read_to_string(&path) {
                Ok(json) => json,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", path, e);
                    std::process::exit(1);
                }
            };
            match SchedulerConfig::from_json(&json) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        None => SchedulerConfig::default(),
    };

    let scheduler = match Scheduler::with_config(config) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            eprintln!("Failed to start scheduler: {}", e);
            std::process::exit(1);
        }
    };
    println!(
        "Initialized scheduler with {} worker threads (+ the main thread while it waits)\n",
        scheduler.num_workers()
    );

    // Example 1: Fan-out / fan-in
    println!("Example 1: Fan-out / fan-in");
    let sum = Arc::new(AtomicUsize::new(0));
    let num_jobs = 100;

    let start = Instant::now();
    let works = (0..num_jobs).map(|i| {
        let sum = sum.clone();
        move |_: &Context<'_>| {
            let mut _local_sum = 0;
            for j in 0..1000 {
                _local_sum += j;
            }
            sum.fetch_add(i, Ordering::SeqCst);
        }
    });
    match scheduler.run_batch(JobPriority::Normal, works) {
        Ok(counter) => scheduler.wait_for(&counter),
        Err(full) => eprintln!("  Backpressure: {}", full),
    }

    let expected_sum: usize = (0..num_jobs).sum();
    println!("  Executed {} jobs in {:?}", num_jobs, start.elapsed());
    println!("  Sum result: {} (expected: {})\n", sum.load(Ordering::SeqCst), expected_sum);

    // Example 2: Dependency chain. Each stage awaits the one it spawned,
    // parking its fiber while the worker keeps running other jobs.
    println!("Example 2: Dependency chain");
    let depth = 32;
    let start = Instant::now();
    let reached = Arc::new(AtomicUsize::new(0));
    let reached_clone = reached.clone();
    match scheduler.run(JobPriority::High, move |ctx| chain(ctx, depth, reached_clone)) {
        Ok(counter) => scheduler.wait_for(&counter),
        Err(full) => eprintln!("  Backpressure: {}", full),
    }
    println!(
        "  {} chained stages finished in {:?}\n",
        reached.load(Ordering::SeqCst),
        start.elapsed()
    );

    // Example 3: Staged pipeline with explicit counter targets.
    println!("Example 3: Staged pipeline");
    let stages = 4;
    let per_stage = 64;
    let progress = Counter::new(stages * per_stage);
    let start = Instant::now();
    for stage in 0..stages {
        let jobs: Vec<Job> = (0..per_stage).map(|_| Job::new(|_| std::hint::black_box(()))).collect();
        if let Err(full) = scheduler.run_jobs(JobPriority::Low, jobs, &progress) {
            eprintln!("  Stage {} backpressure: {}", stage, full);
            // Rejected jobs never run; take them off the counter.
            for _ in 0..full.rejected.len() {
                progress.decrement();
            }
        }
        // Wait for this stage before submitting the next one.
        scheduler.await_counter(&progress, (stages - stage - 1) * per_stage);
        println!("  Stage {} done after {:?}", stage, start.elapsed());
    }
    println!();

    // Example 4: High-throughput run
    println!("Example 4: High-throughput run");
    let num_jobs = 10_000;
    let batch = scheduler.config().queue_capacity / 2;
    let start = Instant::now();
    let mut remaining = num_jobs;
    while remaining > 0 {
        let n = remaining.min(batch);
        let works = (0..n).map(|_| {
            |_: &Context<'_>| {
                let mut _x = 0;
                for i in 0..10 {
                    _x += i;
                }
            }
        });
        match scheduler.run_batch(JobPriority::Normal, works) {
            Ok(counter) => scheduler.wait_for(&counter),
            Err(full) => eprintln!("  Backpressure: {}", full),
        }
        remaining -= n;
    }
    let duration = start.elapsed();
    let jobs_per_second = num_jobs as f64 / duration.as_secs_f64();
    println!("  Executed {} jobs in {:?}", num_jobs, duration);
    println!("  Throughput: {:.2} jobs/second\n", jobs_per_second);

    let census = scheduler.census();
    println!(
        "Fibers created: {} of {} (free: {}, waiting: {})\n",
        census.created, census.capacity, census.free, census.waiting
    );

    println!("Shutting down scheduler...");
    match scheduler.shutdown() {
        Ok(()) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {}", e),
    }
}

fn chain(ctx: &Context<'_>, remaining: usize, reached: Arc<AtomicUsize>) {
    reached.fetch_add(1, Ordering::SeqCst);
    if remaining == 0 {
        return;
    }
    let next = reached.clone();
    match ctx.run(JobPriority::High, move |ctx| chain(ctx, remaining - 1, next)) {
        Ok(child) => ctx.wait_for(&child),
        Err(full) => log::warn!("chain stopped at depth {}: {}", remaining, full),
    }
}
