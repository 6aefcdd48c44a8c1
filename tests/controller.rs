use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskpipe::resilience::RateLimiterConfig;
use taskpipe::{
    handler_fn, BoxError, Error, PipelineConfig, Task, TaskContext, TaskController,
    TaskControllerBuilder,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Handler that records which payloads actually ran.
fn recording_handler(
    ran: Arc<Mutex<Vec<u32>>>,
    work: Duration,
) -> impl taskpipe::TaskHandler<Payload = u32, Output = u32> {
    handler_fn(move |n: u32, ctx: TaskContext| {
        let ran = ran.clone();
        async move {
            ran.lock().unwrap().push(n);
            tokio::select! {
                _ = ctx.cancelled() => Err::<u32, BoxError>(format!("task {n} cancelled").into()),
                _ = tokio::time::sleep(work) => Ok(n * 10),
            }
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_cache_hits_do_not_consume_rate_limit() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let config = PipelineConfig::new()
        .with_rate_limit(RateLimiterConfig::new().with_capacity(1).with_refill_rate(0.01));
    let controller =
        TaskController::new(config, recording_handler(ran.clone(), Duration::ZERO)).unwrap();

    let token = CancellationToken::new();
    let first = controller
        .submit(Task::new(4).with_cache_key("4|v1"), "alice", token.clone())
        .await
        .unwrap();
    // bucket is now empty, but a fresh cache hit is free
    for _ in 0..5 {
        let again = controller
            .submit(Task::new(4).with_cache_key("4|v1"), "alice", token.clone())
            .await
            .unwrap();
        assert_eq!(again, first);
    }
    // a miss for the same identity is rejected
    let miss = controller
        .submit(Task::new(5).with_cache_key("5|v1"), "alice", token)
        .await;
    assert!(matches!(miss, Err(Error::RateLimited { .. })));
    assert!(miss.unwrap_err().is_retryable());

    assert_eq!(*ran.lock().unwrap(), vec![4]);
    let stats = controller.stats();
    assert_eq!(stats.cache_hits, 5);
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_results_are_not_cached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        handler_fn(move |_: (), _ctx: TaskContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u8, BoxError>("backend unavailable".into())
            }
        })
    };
    let controller = TaskController::new(PipelineConfig::default(), handler).unwrap();

    for _ in 0..2 {
        let res = controller
            .submit(Task::new(()).with_cache_key("k"), "bob", CancellationToken::new())
            .await;
        match res {
            Err(Error::Handler { source, .. }) => {
                assert_eq!(source.to_string(), "backend unavailable")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(controller.cache().is_empty());
    assert_eq!(controller.stats().failed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_deadline_never_executes() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let controller = TaskController::new(
        PipelineConfig::default(),
        recording_handler(ran.clone(), Duration::from_millis(10)),
    )
    .unwrap();

    let task = Task::new(1).with_deadline(Instant::now());
    let res = controller
        .submit(task, "carol", CancellationToken::new())
        .await;
    assert!(matches!(res, Err(Error::Timeout { .. })));

    controller.shutdown(Duration::from_secs(1)).await.unwrap();
    assert!(ran.lock().unwrap().is_empty());
    assert_eq!(controller.stats().canceled_while_queued, 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_while_queued_skips_execution() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let config = PipelineConfig::new().with_workers(1);
    let controller = Arc::new(
        TaskController::new(config, recording_handler(ran.clone(), Duration::from_secs(1)))
            .unwrap(),
    );

    let slow = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .submit(Task::new(1), "dave", CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    let res = controller
        .submit(
            Task::new(2).with_timeout(Duration::from_millis(100)),
            "dave",
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(res, Err(Error::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_millis(200));

    assert_eq!(slow.await.unwrap().unwrap(), 10);
    controller.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(*ran.lock().unwrap(), vec![1]);

    let stats = controller.stats();
    assert_eq!(stats.canceled_while_queued, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(controller.signals().pool.skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_running_is_cooperative() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let controller = Arc::new(
        TaskController::new(
            PipelineConfig::default(),
            recording_handler(ran.clone(), Duration::from_secs(60)),
        )
        .unwrap(),
    );

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
    }
    let started = Instant::now();
    let res = controller.submit(Task::new(7), "erin", token).await;
    assert!(matches!(res, Err(Error::Canceled { .. })));
    assert!(started.elapsed() < Duration::from_millis(100));

    // the handler observed the signal and returned, so draining is immediate
    controller.shutdown(Duration::from_millis(50)).await.unwrap();
    assert_eq!(*ran.lock().unwrap(), vec![7]);
    assert_eq!(controller.stats().canceled_while_running, 1);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_backpressures_and_push_is_cancelable() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let controller = Arc::new(
        TaskControllerBuilder::new()
            .queue_capacity(1)
            .workers(1)
            .build(recording_handler(ran.clone(), Duration::from_secs(1)))
            .unwrap(),
    );

    let mut background = Vec::new();
    for n in [1, 2] {
        let controller = controller.clone();
        background.push(tokio::spawn(async move {
            controller
                .submit(Task::new(n), &format!("id-{n}"), CancellationToken::new())
                .await
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    // 1 is running, 2 fills the queue; 3 blocks on push until canceled
    let signals = controller.signals();
    assert_eq!(signals.queue.len, 1);
    assert_eq!(signals.pool.running, 1);

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
    }
    let started = Instant::now();
    let res = controller.submit(Task::new(3), "id-3", token).await;
    assert!(matches!(res, Err(Error::Canceled { .. })));
    assert!(started.elapsed() < Duration::from_millis(100));

    for h in background {
        assert!(h.await.unwrap().is_ok());
    }
    assert_eq!(*ran.lock().unwrap(), vec![1, 2]);
    assert_eq!(controller.signals().queue.high_water_mark, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_abandons_outstanding_work() {
    // ignores cancellation, so only abandonment can end it
    fn make_handler() -> impl taskpipe::TaskHandler<Payload = u32, Output = u32> {
        handler_fn(|n: u32, _ctx: TaskContext| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, BoxError>(n)
        })
    }
    let handler = make_handler();
    let config = PipelineConfig::new()
        .with_workers(1)
        .with_drain_timeout(Duration::from_millis(100));
    let controller = Arc::new(TaskController::new(config, handler).unwrap());

    let mut submitters = Vec::new();
    for n in 0..3u32 {
        let controller = controller.clone();
        submitters.push(tokio::spawn(async move {
            controller
                .submit(Task::new(n), &format!("user-{n}"), CancellationToken::new())
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    match controller.shutdown_default().await {
        Err(Error::ShutdownTimeout {
            drain_timeout,
            outstanding,
        }) => {
            assert_eq!(drain_timeout, Duration::from_millis(100));
            assert_eq!(outstanding, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    for s in submitters {
        assert!(matches!(s.await.unwrap(), Err(Error::Abandoned { .. })));
    }

    // repeated shutdown reports the same outcome
    assert!(matches!(
        controller.shutdown(Duration::from_secs(1)).await,
        Err(Error::ShutdownTimeout { outstanding: 3, .. })
    ));
    let res = controller
        .submit(Task::new(9), "late", CancellationToken::new())
        .await;
    assert!(matches!(res, Err(Error::QueueClosed)));

    let stats = controller.stats();
    assert_eq!(stats.canceled_while_running, 1);
    assert_eq!(stats.canceled_while_queued, 2);
    assert_eq!(stats.rejected_closed, 1);
    assert_eq!(stats.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_every_task_reaches_exactly_one_terminal_state() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    fn make_handler(
        ran: Arc<Mutex<Vec<u32>>>,
    ) -> impl taskpipe::TaskHandler<Payload = u32, Output = u32> {
        handler_fn(move |n: u32, ctx: TaskContext| {
            let ran = ran.clone();
            async move {
                ran.lock().unwrap().push(n);
                let work = if n % 5 == 1 {
                    Duration::from_secs(10)
                } else {
                    Duration::from_millis(50)
                };
                if n % 5 == 0 {
                    return Err::<u32, BoxError>("rejected by handler".into());
                }
                tokio::select! {
                    _ = ctx.cancelled() => Err("cancelled".into()),
                    _ = tokio::time::sleep(work) => Ok(n),
                }
            }
        })
    }
    let handler = make_handler(ran.clone());
    let controller = Arc::new(
        TaskControllerBuilder::new()
            .config(
                PipelineConfig::new().with_rate_limit(RateLimiterConfig::new().with_capacity(20)),
            )
            .queue_capacity(4)
            .workers(3)
            .max_concurrency(2)
            .build(handler)
            .unwrap(),
    );

    let total = 30u32;
    let mut submitters = Vec::new();
    for n in 0..total {
        let controller = controller.clone();
        let token = CancellationToken::new();
        if n % 7 == 3 {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                token.cancel();
            });
        }
        submitters.push(tokio::spawn(async move {
            let task = Task::new(n).with_timeout(Duration::from_millis(500));
            controller.submit(task, "shared", token).await
        }));
    }

    let mut outcomes = Vec::new();
    for s in submitters {
        outcomes.push(s.await.unwrap());
    }
    controller.shutdown(Duration::from_secs(30)).await.unwrap();

    let stats = controller.stats();
    assert_eq!(stats.submitted, total as u64);
    assert_eq!(stats.terminal(), total as u64);
    assert_eq!(stats.in_flight(), 0);
    assert_eq!(
        stats.completed,
        outcomes.iter().filter(|o| o.is_ok()).count() as u64
    );

    // no payload ran twice
    let ran = ran.lock().unwrap();
    let unique: HashSet<_> = ran.iter().collect();
    assert_eq!(unique.len(), ran.len());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_submission_while_queued_is_skipped() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let config = PipelineConfig::new().with_workers(1);
    let controller = Arc::new(
        TaskController::new(
            config,
            recording_handler(ran.clone(), Duration::from_millis(500)),
        )
        .unwrap(),
    );

    let busy = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .submit(Task::new(1), "frank", CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // the caller stops waiting by dropping the submit future
    let dropped = tokio::time::timeout(
        Duration::from_millis(10),
        controller.submit(Task::new(2), "frank", CancellationToken::new()),
    )
    .await;
    assert!(dropped.is_err());
    let stats = controller.stats();
    assert_eq!(stats.canceled_while_queued, 1);
    assert_eq!(stats.in_flight(), 1);

    assert_eq!(busy.await.unwrap().unwrap(), 10);
    controller.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(*ran.lock().unwrap(), vec![1]);
    let stats = controller.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.terminal(), 2);
    assert_eq!(stats.in_flight(), 0);
    assert_eq!(controller.signals().pool.skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_submission_while_running_signals_handler() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let controller = TaskController::new(
        PipelineConfig::default(),
        recording_handler(ran.clone(), Duration::from_secs(60)),
    )
    .unwrap();

    let dropped = tokio::time::timeout(
        Duration::from_millis(20),
        controller.submit(Task::new(3), "grace", CancellationToken::new()),
    )
    .await;
    assert!(dropped.is_err());

    // the handler saw the cancellation, so the pool drains well inside the window
    controller.shutdown(Duration::from_millis(50)).await.unwrap();
    assert_eq!(*ran.lock().unwrap(), vec![3]);
    let stats = controller.stats();
    assert_eq!(stats.canceled_while_running, 1);
    assert_eq!(stats.in_flight(), 0);
}
