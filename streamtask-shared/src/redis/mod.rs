/// Redis integration for the task stream
///
/// This module provides the Redis-backed [`StreamStore`](crate::store::StreamStore)
/// variants:
/// - Single node over `ConnectionManager` with automatic reconnection
/// - Cluster over the async cluster connection
/// - Connection setup from [`RedisConfig`](crate::config::RedisConfig) with a
///   PING health check
///
/// # Architecture
///
/// ```text
/// ┌─────────────┐
/// │  Producers  │ ──XADD MAXLEN ~ n──> {stream}
/// └─────────────┘                         │
///                                         │ XREADGROUP GROUP {group} {consumer} BLOCK
///                                         ▼
///                                  ┌─────────────┐
///                                  │   Worker    │ ──XACK──> pending list of {group}
///                                  └─────────────┘
/// ```
///
/// # Example
///
/// ```no_run
/// use streamtask_shared::config::RedisConfig;
/// use streamtask_shared::redis::connect;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = connect(&RedisConfig::from_url("redis://localhost:6379")).await?;
/// store.create_group("jobs", "workers").await?;
/// # Ok(())
/// # }
/// ```

pub mod client;
pub mod store;

// Re-export common types for convenience
pub use client::{connect, connect_cluster, connect_single};
pub use store::{RedisClusterStore, RedisStore, RedisStreamStore};
