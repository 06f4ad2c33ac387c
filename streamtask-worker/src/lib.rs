//! # StreamTask Worker Library
//!
//! A pull-style task queue on top of Redis Streams consumer groups.
//!
//! ## Modules
//!
//! - `worker`: The stream worker (queue, request, run, shutdown)
//! - `handoff`: Single-slot rendezvous between the consumer loop and requesters
//! - `handler`: Task handler contract used by `run`
//! - `timeout`: Per-task timeout enforcement
//! - `runner`: Host loop that requests and runs tasks concurrently
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamtask_shared::{MemoryStore, StreamConfig};
//! use streamtask_worker::handler::LogHandler;
//! use streamtask_worker::worker::{QueueWorker, StreamWorker};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let worker = StreamWorker::new(store, StreamConfig::default(), Arc::new(LogHandler)).await?;
//! let task = worker.request().await?;
//! println!("Got task {}", task.id);
//! # Ok(())
//! # }
//! ```

pub mod handler;
pub mod handoff;
pub mod runner;
pub mod timeout;
pub mod worker;

pub use handler::{HandlerError, TaskContext, TaskHandler};
pub use worker::{Lifecycle, QueueWorker, StreamWorker, WorkerError};
