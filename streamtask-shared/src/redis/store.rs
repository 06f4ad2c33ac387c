/// Redis-backed stream store
///
/// Implements [`StreamStore`] over any async Redis connection, which gives the
/// two variants the worker can run against:
///
/// ```text
/// RedisStore         = RedisStreamStore<ConnectionManager>    (single node)
/// RedisClusterStore  = RedisStreamStore<ClusterConnection>    (cluster)
/// ```
///
/// Each store holds two connections. Group reads use `BLOCK`, which parks the
/// socket server-side, so they run on a dedicated reader connection while
/// XADD, XACK and PING go through the writer.
///
/// Use [`crate::redis::connect`] to build one from configuration.

use crate::store::{Fields, StoreError, StreamEntry, StreamStore};
use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster_async::ClusterConnection;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use std::sync::Mutex;
use std::time::Duration;

/// Single-node variant
pub type RedisStore = RedisStreamStore<ConnectionManager>;

/// Cluster variant
pub type RedisClusterStore = RedisStreamStore<ClusterConnection>;

/// Stream store over a Redis connection type
pub struct RedisStreamStore<C> {
    /// Connection for blocking group reads (None once closed)
    reader: Mutex<Option<C>>,

    /// Connection for everything else (None once closed)
    writer: Mutex<Option<C>>,

    /// Sanitized target, for logs
    label: String,

    /// Health check timeout
    command_timeout: Duration,
}

impl<C> RedisStreamStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    /// Wraps already-established connections
    pub fn new(reader: C, writer: C, label: String, command_timeout: Duration) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            label,
            command_timeout,
        }
    }

    /// Sanitized connection target
    pub fn label(&self) -> &str {
        &self.label
    }

    fn reader(&self) -> Result<C, StoreError> {
        checkout(&self.reader)
    }

    fn writer(&self) -> Result<C, StoreError> {
        checkout(&self.writer)
    }
}

/// Clones a connection handle out of its slot
fn checkout<C: Clone>(slot: &Mutex<Option<C>>) -> Result<C, StoreError> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
        .ok_or(StoreError::Closed)
}

/// Converts an XREADGROUP reply into entries with string fields
///
/// Values that are not valid strings are dropped from the field map.
fn parse_reply(reply: StreamReadReply) -> Vec<StreamEntry> {
    let mut entries = Vec::new();

    for stream_key in reply.keys {
        for stream_id in stream_key.ids {
            let fields: Fields = stream_id
                .map
                .into_iter()
                .filter_map(|(k, v)| {
                    let value = redis::from_redis_value::<String>(&v).ok()?;
                    Some((k, value))
                })
                .collect();

            entries.push(StreamEntry::new(stream_id.id, fields));
        }
    }

    entries
}

fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

#[async_trait]
impl<C> StreamStore for RedisStreamStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.writer()?;

        let result: Result<(), RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;

        match result {
            Ok(()) => {
                tracing::info!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if is_busy_group(&e) => {
                tracing::debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.reader()?;

        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1))
            .block(block.as_millis().max(1) as usize);

        // A timed-out BLOCK replies with nil
        let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[">"], &opts).await?;

        Ok(reply.map(parse_reply).unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.writer()?;
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn add(
        &self,
        stream: &str,
        fields: &Fields,
        max_len: usize,
    ) -> Result<String, StoreError> {
        let mut conn = self.writer()?;

        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let id: String = if max_len > 0 {
            conn.xadd_maxlen(stream, StreamMaxlen::Approx(max_len), "*", &items)
                .await?
        } else {
            conn.xadd(stream, "*", &items).await?
        };

        Ok(id)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.writer()?;

        let result: Result<String, RedisError> = tokio::time::timeout(
            self.command_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| StoreError::HealthCheckFailed("PING command timed out".to_string()))?;

        match result {
            Ok(pong) if pong == "PONG" => {
                tracing::debug!("Redis health check: PONG received");
                Ok(())
            }
            Ok(other) => Err(StoreError::HealthCheckFailed(format!(
                "unexpected response: {}",
                other
            ))),
            Err(e) => {
                tracing::error!(target_node = %self.label, error = %e, "Redis health check failed");
                Err(StoreError::HealthCheckFailed(e.to_string()))
            }
        }
    }

    async fn close(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if reader.is_some() || writer.is_some() {
            tracing::info!(target_node = %self.label, "Redis connections released");
        }
    }
}
