use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use resourcerer::Config;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Outcome, PreparedWorkload, WorkloadsConfig, prepare_workload};

#[derive(Default)]
struct Stats {
    durations: DDSketch,
    errored: usize,
    timed_out: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            prepare_workload(&config, workload)
                .with_context(|| format!("invalid workload {i}"))
                .map(Arc::new)
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure the runtime is warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                workload.run_operation().await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    let warmup_fetches: Vec<_> = workloads.iter().map(|w| w.transport_fetches()).collect();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let stats = Arc::new(Mutex::new(Stats::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let stats = Arc::clone(&stats);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let outcome = workload.run_operation().await;

                            transaction.finish();

                            if let Ok(mut stats) = stats.lock() {
                                stats.durations.add(task_start.elapsed().as_secs_f64());
                                match outcome {
                                    Outcome::Loaded => {}
                                    Outcome::Errored => stats.errored += 1,
                                    Outcome::TimedOut => stats.timed_out += 1,
                                }
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            match stats.lock() {
                Ok(mut stats) => std::mem::take(&mut *stats),
                Err(_) => Stats::default(),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let stats = task.context("stresstest task panicked")?;
        let workload = &workloads[i];
        let concurrency = workload.concurrency;

        let ops = stats.durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        if ops == 0 {
            continue;
        }

        let avg = Duration::from_secs_f64(stats.durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(&stats.durations, 0.5);
        let p90 = quantile(&stats.durations, 0.9);
        let p99 = quantile(&stats.durations, 0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");

        let requests = ops * workload.requests_per_operation();
        let fetches = workload.transport_fetches().saturating_sub(warmup_fetches[i]);
        let ratio = fetches as f64 / requests as f64;
        println!(
            "  {fetches} fetches for {requests} requests ({ratio:.3} fetches/request); errored: {}; timed out: {}",
            stats.errored, stats.timed_out
        );

        workload.shutdown();
    }

    Ok(())
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    let value = sketch.quantile(q).ok().flatten().unwrap_or_default();
    Duration::from_secs_f64(value)
}
