/// Stream store capability
///
/// The worker never talks to Redis directly. It depends on this trait, which
/// covers the handful of stream and consumer-group operations it needs:
///
/// ```text
/// create_group ── XGROUP CREATE <stream> <group> $ MKSTREAM
/// read_group   ── XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <stream> >
/// ack          ── XACK <stream> <group> <id>
/// add          ── XADD <stream> [MAXLEN ~ n] * field value ...
/// ping         ── PING
/// close        ── release connections
/// ```
///
/// Two Redis variants live in [`crate::redis`] (single node and cluster) and
/// an in-memory variant lives in [`crate::memory`].
use async_trait::async_trait;
use redis::RedisError;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection error
    #[error("Store connection error: {0}")]
    Connection(String),

    /// Command execution error
    #[error("Store command error: {0}")]
    Command(String),

    /// Configuration error
    #[error("Store configuration error: {0}")]
    Config(String),

    /// Health check failed
    #[error("Store health check failed: {0}")]
    HealthCheckFailed(String),

    /// The store was closed
    #[error("Store is closed")]
    Closed,
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::IoError => StoreError::Connection(format!("IO error: {}", err)),
            redis::ErrorKind::ResponseError => {
                StoreError::Command(format!("Response error: {}", err))
            }
            _ => StoreError::Command(err.to_string()),
        }
    }
}

/// Field map of a stream entry
pub type Fields = HashMap<String, String>;

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Stream entry ID (format: "timestamp-sequence")
    pub id: String,

    /// Field-value pairs
    pub fields: Fields,
}

impl StreamEntry {
    /// Creates a new entry
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        StreamEntry {
            id: id.into(),
            fields,
        }
    }

    /// Returns a field value
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Operations the worker needs from a stream store
///
/// Implementations must be safe for concurrent use: the consumer loop reads
/// and acknowledges while any number of callers add entries.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Creates the consumer group (and the stream) if absent
    ///
    /// The group starts at the current end of the stream. An existing group
    /// is not an error.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    /// Reads up to `count` never-delivered entries for `consumer`
    ///
    /// Blocks for at most `block`. Returns an empty vector when the wait
    /// elapses without new entries. Returned entries are pending for the
    /// group until acknowledged.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledges an entry, removing it from the group's pending list
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError>;

    /// Appends an entry and returns its ID
    ///
    /// When `max_len` is non-zero the stream is trimmed to roughly that many
    /// entries, oldest first.
    async fn add(&self, stream: &str, fields: &Fields, max_len: usize)
        -> Result<String, StoreError>;

    /// Health check
    async fn ping(&self) -> Result<(), StoreError>;

    /// Releases the underlying connections
    ///
    /// Idempotent. Operations issued afterwards fail with [`StoreError::Closed`].
    async fn close(&self);
}
