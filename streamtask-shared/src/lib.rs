//! # StreamTask Shared Library
//!
//! This crate contains the types and store implementations shared by the
//! StreamTask worker and by producers that only enqueue tasks.
//!
//! ## Module Organization
//!
//! - `store`: The stream store capability trait and entry types
//! - `redis`: Single-node and cluster Redis stores
//! - `memory`: In-memory store with consumer-group semantics
//! - `config`: Connection and stream configuration
//! - `message`: Task messages and their stream encoding

pub mod config;
pub mod memory;
pub mod message;
pub mod redis;
pub mod store;

pub use config::{RedisConfig, StreamConfig};
pub use memory::MemoryStore;
pub use message::{MessageError, TaskMessage};
pub use store::{Fields, StoreError, StreamEntry, StreamStore};

/// Current version of the StreamTask shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
