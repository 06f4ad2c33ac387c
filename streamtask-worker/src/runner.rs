/// Host loop driving a worker
///
/// The runner repeatedly requests a task and executes it, keeping at most
/// `max_concurrent_tasks` runs in flight. It is the scheduler used by the
/// binary; embedding applications can drive a [`QueueWorker`] themselves.
///
/// # Architecture
///
/// ```text
/// Runner
///   ├─> QueueWorker::request
///   │     ├─ task            ──> spawn QueueWorker::run
///   │     ├─ NoTaskInQueue   ──> request again
///   │     └─ QueueHasBeenClosed ──> stop
///   └─> on shutdown token: cancel runs, wait for them, return
/// ```
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use streamtask_worker::runner::{Runner, RunnerConfig};
/// use streamtask_worker::worker::StreamWorker;
///
/// # async fn example(worker: Arc<StreamWorker>) -> anyhow::Result<()> {
/// let runner = Runner::new(worker, RunnerConfig::default());
/// let shutdown = runner.shutdown_token();
///
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     shutdown.cancel();
/// });
///
/// runner.run().await?;
/// # Ok(())
/// # }
/// ```

use crate::worker::{QueueWorker, WorkerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum concurrent task runs
    pub max_concurrent_tasks: usize,

    /// How long in-flight runs get to finish after shutdown
    pub drain_timeout: Duration,

    /// Pause after an unexpected request error
    pub error_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            max_concurrent_tasks: 4,
            drain_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl RunnerConfig {
    /// Loads configuration from environment variables
    ///
    /// # Environment Variables
    ///
    /// - `WORKER_CONCURRENCY`: Maximum concurrent task runs (default: 4)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = RunnerConfig::default();

        if let Ok(value) = std::env::var("WORKER_CONCURRENCY") {
            let n: usize = value
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid WORKER_CONCURRENCY '{}': {}", value, e))?;
            config.max_concurrent_tasks = n.max(1);
        }

        Ok(config)
    }
}

/// Requests and runs tasks until shutdown
pub struct Runner<W> {
    /// Worker being driven
    worker: Arc<W>,

    /// Configuration
    config: RunnerConfig,

    /// Shutdown token
    shutdown_token: CancellationToken,
}

impl<W> Runner<W>
where
    W: QueueWorker + 'static,
{
    /// Creates a new runner
    pub fn new(worker: Arc<W>, config: RunnerConfig) -> Self {
        Runner {
            worker,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Gets shutdown token
    ///
    /// Cancelling it stops the runner after in-flight runs finish.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs until the shutdown token fires or the queue is closed
    ///
    /// Returns the number of tasks that were run.
    pub async fn run(&self) -> anyhow::Result<usize> {
        tracing::info!(
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "Runner starting"
        );

        let capacity = self.config.max_concurrent_tasks.max(1);
        let slots = Arc::new(Semaphore::new(capacity));
        let mut dispatched = 0usize;

        loop {
            let permit = tokio::select! {
                biased;

                _ = self.shutdown_token.cancelled() => break,
                permit = slots.clone().acquire_owned() => permit?,
            };

            let requested = tokio::select! {
                biased;

                _ = self.shutdown_token.cancelled() => break,
                requested = self.worker.request() => requested,
            };

            let task = match requested {
                Ok(task) => task,
                Err(WorkerError::NoTaskInQueue) => continue,
                Err(WorkerError::QueueHasBeenClosed) => {
                    tracing::info!("Queue closed, runner stopping");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to request task");
                    sleep(self.config.error_backoff).await;
                    continue;
                }
            };

            let worker = self.worker.clone();
            let cancel_token = self.shutdown_token.child_token();
            dispatched += 1;

            tokio::spawn(async move {
                let task_id = task.id;
                match worker.run(cancel_token, task).await {
                    Ok(()) => tracing::info!(task_id = %task_id, "Task succeeded"),
                    Err(e) => tracing::error!(task_id = %task_id, error = %e, "Task failed"),
                }
                drop(permit);
            });
        }

        let active = capacity - slots.available_permits();
        if active > 0 {
            tracing::info!(count = active, "Waiting for active tasks to complete");
            self.shutdown_token.cancel();

            // Every permit back means every run finished
            let drain = slots.acquire_many(capacity as u32);
            if tokio::time::timeout(self.config.drain_timeout, drain).await.is_err() {
                tracing::warn!(
                    count = capacity - slots.available_permits(),
                    "Force shutdown with tasks still running"
                );
            }
        }

        tracing::info!(tasks = dispatched, "Runner shut down");
        Ok(dispatched)
    }
}
