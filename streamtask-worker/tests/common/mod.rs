//! Common test utilities for integration tests
//!
//! This module provides shared infrastructure for worker tests:
//! - An in-memory store shared by one or more workers
//! - Worker construction with short block times
//! - Polling helpers for store state

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use streamtask_shared::{MemoryStore, StreamConfig};
use streamtask_worker::handler::{LogHandler, TaskHandler};
use streamtask_worker::worker::StreamWorker;

pub const STREAM: &str = "test:tasks";
pub const GROUP: &str = "test-workers";

/// Stream config for a named consumer
pub fn stream_config(consumer: &str) -> StreamConfig {
    StreamConfig::new(STREAM, GROUP, consumer)
        .with_block_time(Duration::from_millis(100))
        .with_max_length(1000)
}

/// Test context containing a store and a worker over it
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub worker: Arc<StreamWorker>,
}

impl TestContext {
    /// Creates a worker with the logging handler over a fresh store
    pub async fn new() -> Self {
        Self::with_handler(Arc::new(LogHandler)).await
    }

    /// Creates a worker with the given handler over a fresh store
    pub async fn with_handler(handler: Arc<dyn TaskHandler>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let worker = new_worker(&store, "consumer-a", handler).await;

        TestContext { store, worker }
    }

    /// IDs pending for the group
    pub fn pending_ids(&self) -> Vec<String> {
        self.store
            .pending(STREAM, GROUP)
            .into_iter()
            .map(|p| p.id)
            .collect()
    }
}

/// Creates another worker over an existing store
pub async fn new_worker(
    store: &Arc<MemoryStore>,
    consumer: &str,
    handler: Arc<dyn TaskHandler>,
) -> Arc<StreamWorker> {
    let worker = StreamWorker::new(store.clone(), stream_config(consumer), handler)
        .await
        .expect("worker construction");
    Arc::new(worker)
}

/// Helper to wait for condition with timeout
pub async fn wait_for<F>(condition: F, timeout: Duration) -> anyhow::Result<()>
where
    F: Fn() -> bool,
{
    let start = tokio::time::Instant::now();

    loop {
        if condition() {
            return Ok(());
        }

        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within {:?}", timeout);
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
