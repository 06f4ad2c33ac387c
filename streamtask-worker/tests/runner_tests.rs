/// Integration tests for the runner
///
/// The runner is driven against a worker over the in-memory store.

mod common;

use common::{wait_for, TestContext};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamtask_shared::TaskMessage;
use streamtask_worker::handler::{handler_fn, HandlerError, TaskContext};
use streamtask_worker::runner::{Runner, RunnerConfig};
use streamtask_worker::worker::QueueWorker;

async fn counting_context(calls: Arc<AtomicUsize>) -> TestContext {
    let handler = handler_fn("count", move |_ctx, task: TaskMessage| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if task.body == json!("fail") {
                return Err(HandlerError::Failed("requested failure".to_string()));
            }
            Ok(())
        }
    });
    TestContext::with_handler(Arc::new(handler)).await
}

#[tokio::test]
async fn test_runner_runs_queued_tasks() {
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = counting_context(calls.clone()).await;

    for n in 0..5 {
        ctx.worker.queue(&TaskMessage::new(json!(n))).await.unwrap();
    }
    ctx.worker.queue(&TaskMessage::new(json!("fail"))).await.unwrap();

    let runner = Runner::new(ctx.worker.clone(), RunnerConfig::default());
    let shutdown = runner.shutdown_token();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_for(|| calls.load(Ordering::SeqCst) == 6, Duration::from_secs(5))
        .await
        .unwrap();

    shutdown.cancel();
    let dispatched = handle.await.unwrap().unwrap();
    assert_eq!(dispatched, 6);

    ctx.worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runner_stops_when_queue_closes() {
    let ctx = TestContext::new().await;

    let runner = Runner::new(ctx.worker.clone(), RunnerConfig::default());
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.worker.shutdown().await.unwrap();

    let dispatched = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("runner should stop once the queue closes")
        .unwrap()
        .unwrap();
    assert_eq!(dispatched, 0);
}

#[tokio::test(start_paused = true)]
async fn test_runner_respects_concurrency_cap() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let handler = {
        let running = running.clone();
        let peak = peak.clone();
        let completed = completed.clone();
        handler_fn("slow", move |_ctx: TaskContext, _task| {
            let running = running.clone();
            let peak = peak.clone();
            let completed = completed.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(500)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    let ctx = TestContext::with_handler(Arc::new(handler)).await;

    for n in 0..6 {
        ctx.worker.queue(&TaskMessage::new(json!(n))).await.unwrap();
    }

    let config = RunnerConfig {
        max_concurrent_tasks: 2,
        ..RunnerConfig::default()
    };
    let runner = Runner::new(ctx.worker.clone(), config);
    let shutdown = runner.shutdown_token();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_for(|| completed.load(Ordering::SeqCst) == 6, Duration::from_secs(10))
        .await
        .unwrap();

    shutdown.cancel();
    assert_eq!(handle.await.unwrap().unwrap(), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    ctx.worker.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_runner_cancels_runs_on_shutdown() {
    let started = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));

    let handler = {
        let started = started.clone();
        let cancelled = cancelled.clone();
        handler_fn("waits", move |ctx: TaskContext, _task| {
            let started = started.clone();
            let cancelled = cancelled.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                ctx.cancelled().await;
                cancelled.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Cancelled)
            }
        })
    };
    let ctx = TestContext::with_handler(Arc::new(handler)).await;
    ctx.worker
        .queue(&TaskMessage::new(json!("long")))
        .await
        .unwrap();

    let runner = Runner::new(ctx.worker.clone(), RunnerConfig::default());
    let shutdown = runner.shutdown_token();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_for(|| started.load(Ordering::SeqCst) == 1, Duration::from_secs(5))
        .await
        .unwrap();

    shutdown.cancel();
    assert_eq!(handle.await.unwrap().unwrap(), 1);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);

    ctx.worker.shutdown().await.unwrap();
}
