//! # StreamTask Worker
//!
//! Consumes tasks from a Redis stream through a consumer group and runs them.
//!
//! ## Architecture
//!
//! The worker binary:
//! - Connects to Redis (single node or cluster) from environment settings
//! - Creates the consumer group if it does not exist
//! - Requests tasks and runs them with a concurrency cap
//! - On Ctrl-C, stops requesting, requeues any undelivered entry and exits
//!
//! ## Usage
//!
//! ```bash
//! REDIS_ADDR=127.0.0.1:6379 STREAM_NAME=tasks cargo run -p streamtask-worker
//! ```
//!
//! Set `LOG_FORMAT=json` for JSON logs; `RUST_LOG` overrides the filter.

use std::sync::Arc;
use streamtask_shared::redis::connect;
use streamtask_shared::{RedisConfig, StreamConfig};
use streamtask_worker::handler::LogHandler;
use streamtask_worker::runner::{Runner, RunnerConfig};
use streamtask_worker::worker::{QueueWorker, StreamWorker};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamtask_worker=info,streamtask_shared=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    tracing::info!(
        "StreamTask Worker v{} starting...",
        env!("CARGO_PKG_VERSION")
    );

    let redis_config = RedisConfig::from_env()?;
    let stream_config = StreamConfig::from_env()?;
    let runner_config = RunnerConfig::from_env()?;

    let store = connect(&redis_config).await?;
    let worker = Arc::new(StreamWorker::new(store, stream_config, Arc::new(LogHandler)).await?);

    let runner = Runner::new(worker.clone(), runner_config);
    let shutdown = runner.shutdown_token();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    tracing::info!("Worker ready and listening for tasks");
    let tasks = runner.run().await?;

    if let Err(e) = worker.shutdown().await {
        tracing::warn!(error = %e, "Worker shutdown reported an error");
    }

    tracing::info!(tasks, "Exiting");
    Ok(())
}
