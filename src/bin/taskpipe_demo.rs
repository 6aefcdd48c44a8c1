//! taskpipe-demo: 生产者/消费者调度演示
//!
//! Usage:
//!   taskpipe-demo [--tasks <n>] [--sleep-ms <ms>]
//!
//! Submits `n` tasks that each sleep `ms` through a controller configured from `TASKPIPE_*`
//! environment variables (defaults: queue 5, workers 2) and reports the wall time next to the
//! ideal `ceil(n / concurrency) * ms`.

use anyhow::{bail, Context};
use std::time::{Duration, Instant};
use taskpipe::{handler_fn, BoxError, PipelineConfig, Task, TaskContext, TaskController};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

struct Args {
    tasks: usize,
    sleep_ms: u64,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        tasks: 8,
        sleep_ms: 300,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--tasks" => {
                let v = it.next().context("--tasks needs a value")?;
                args.tasks = v.parse().with_context(|| format!("invalid --tasks: {v}"))?;
            }
            "--sleep-ms" => {
                let v = it.next().context("--sleep-ms needs a value")?;
                args.sleep_ms = v
                    .parse()
                    .with_context(|| format!("invalid --sleep-ms: {v}"))?;
            }
            "help" | "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                print_usage();
                bail!("unknown argument: {other}");
            }
        }
    }
    Ok(args)
}

fn print_usage() {
    println!(
        r#"taskpipe-demo: 有界队列 + 工作池演示

USAGE:
    taskpipe-demo [--tasks <n>] [--sleep-ms <ms>]

ENVIRONMENT:
    TASKPIPE_QUEUE_CAPACITY     Queue capacity (default 5)
    TASKPIPE_WORKERS            Worker count (default 2)
    TASKPIPE_MAX_CONCURRENCY    Optional cap on running handlers
    RUST_LOG                    Log filter (default info)"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let config = PipelineConfig::from_env();
    let concurrency = config
        .max_concurrency
        .map_or(config.workers, |k| k.min(config.workers));
    let sleep = Duration::from_millis(args.sleep_ms);

    let handler = handler_fn(move |n: usize, ctx: TaskContext| async move {
        tokio::select! {
            _ = ctx.cancelled() => Err::<usize, BoxError>(format!("task {n} cancelled").into()),
            _ = tokio::time::sleep(sleep) => Ok(n),
        }
    });
    let controller = TaskController::new(config, handler)?;

    let started = Instant::now();
    let mut submissions = Vec::with_capacity(args.tasks);
    for n in 0..args.tasks {
        let controller = &controller;
        // Every task gets its own identity so the demo exercises the queue, not the limiter.
        submissions.push(async move {
            controller
                .submit(Task::new(n), &format!("producer-{n}"), CancellationToken::new())
                .await
        });
    }
    let results = futures::future::join_all(submissions).await;
    let elapsed = started.elapsed();

    let mut ok = 0usize;
    for (n, res) in results.into_iter().enumerate() {
        match res {
            Ok(_) => ok += 1,
            Err(e) => eprintln!("task {n} failed: {e}"),
        }
    }

    let ideal = sleep * args.tasks.div_ceil(concurrency.max(1)) as u32;
    let signals = controller.signals();
    println!("completed {ok}/{} tasks", args.tasks);
    println!(
        "wall time {:?} (ideal {:?}), queue high-water {}/{}",
        elapsed, ideal, signals.queue.high_water_mark, signals.queue.capacity
    );
    if let Some(mean) = signals.stats.mean_latency {
        println!("mean latency {:?}", mean);
    }

    controller.shutdown_default().await?;
    Ok(())
}
