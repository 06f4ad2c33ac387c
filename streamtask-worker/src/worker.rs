/// Stream-backed task worker
///
/// A [`StreamWorker`] turns a Redis stream with a consumer group into a pull
/// queue. A single background consumer loop claims one entry at a time and
/// hands it to whichever [`QueueWorker::request`] call is waiting; the entry
/// is acknowledged only after a requester has taken it.
///
/// # Architecture
///
/// ```text
/// producers ── queue() ──> StreamStore::add
///
/// consumer loop
///   ├─> StreamStore::read_group (count 1, block_time)
///   ├─> Handoff::offer ──────────────> request() ──> run()
///   │     ├─ Accepted ──> StreamStore::ack
///   │     └─ Stopped  ──> StreamStore::add (requeue), exit
///   └─> repeat until stop
///
/// shutdown()
///   ├─> lifecycle: Running -> Stopping
///   ├─> cancel stop
///   ├─> wait for the loop (200ms), abort if still running
///   ├─> StreamStore::close
///   └─> Handoff::close, lifecycle: Stopped
/// ```
///
/// # Delivery
///
/// At-least-once. An entry that was claimed but not handed off when shutdown
/// begins is added again as a new entry while the original stays pending for
/// the group, so consumers may see duplicates. [`TaskMessage::id`] survives
/// the requeue and can be used to deduplicate.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use streamtask_shared::{MemoryStore, StreamConfig, TaskMessage};
/// use streamtask_worker::handler::LogHandler;
/// use streamtask_worker::worker::{QueueWorker, StreamWorker};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(MemoryStore::new());
/// let worker = StreamWorker::new(store, StreamConfig::default(), Arc::new(LogHandler)).await?;
///
/// worker.queue(&TaskMessage::new(serde_json::json!({"id": 1}))).await?;
/// let task = worker.request().await?;
/// worker.run(CancellationToken::new(), task).await?;
///
/// worker.shutdown().await?;
/// # Ok(())
/// # }
/// ```

use crate::handler::{HandlerError, TaskContext, TaskHandler};
use crate::handoff::{Handoff, Offer, Take};
use crate::timeout::TimeoutEnforcer;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use streamtask_shared::message::{decode_fields, encode_fields};
use streamtask_shared::{MessageError, StoreError, StreamConfig, StreamEntry, StreamStore, TaskMessage};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a single request attempt waits for a handed-off entry
pub const REQUEST_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts before a request reports an empty queue
pub const REQUEST_MAX_ATTEMPTS: u32 = 5;

/// How long shutdown waits for the consumer loop to finish
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Pause after a failed group read
pub const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Nothing was handed off within the request window; try again later
    #[error("no task in queue")]
    NoTaskInQueue,

    /// The worker shut down; stop requesting
    #[error("queue has been closed")]
    QueueHasBeenClosed,

    /// Queue or shutdown called after shutdown began
    #[error("queue has been shut down")]
    QueueShutdown,

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Task could not be encoded
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Handler failure
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Handler exceeded the task timeout
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
}

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    /// Constructed, consumer loop not spawned
    NotStarted = 0,

    /// Consumer loop spawned
    Running = 1,

    /// Shutdown in progress
    Stopping = 2,

    /// Shutdown finished
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::NotStarted,
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

/// Worker contract exposed to the host scheduler
#[async_trait]
pub trait QueueWorker: Send + Sync {
    /// Publishes a task and returns its stream entry ID
    async fn queue(&self, task: &TaskMessage) -> Result<String, WorkerError>;

    /// Waits for the next task
    ///
    /// Fails with [`WorkerError::NoTaskInQueue`] when nothing arrives in time
    /// (retry later) and with [`WorkerError::QueueHasBeenClosed`] once the
    /// worker has shut down (stop calling).
    async fn request(&self) -> Result<TaskMessage, WorkerError>;

    /// Executes a task
    async fn run(&self, cancel_token: CancellationToken, task: TaskMessage) -> Result<(), WorkerError>;

    /// Stops the worker
    ///
    /// Only the first call does anything; later calls fail with
    /// [`WorkerError::QueueShutdown`].
    async fn shutdown(&self) -> Result<(), WorkerError>;
}

/// Redis stream worker
pub struct StreamWorker {
    /// Stream store
    store: Arc<dyn StreamStore>,

    /// Rendezvous between the consumer loop and requesters
    handoff: Arc<Handoff<StreamEntry>>,

    /// Stops the consumer loop
    stop: CancellationToken,

    /// Stream settings
    config: Arc<StreamConfig>,

    /// Executes tasks for run()
    handler: Arc<dyn TaskHandler>,

    /// Lifecycle as u8
    state: AtomicU8,

    /// Consumer loop task
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamWorker {
    /// Creates a worker and its consumer group
    ///
    /// The group starts at the current end of the stream, so tasks queued
    /// from here on are delivered even if the first request comes later.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be created. An existing group is
    /// reused.
    pub async fn new(
        store: Arc<dyn StreamStore>,
        config: StreamConfig,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, WorkerError> {
        store
            .create_group(&config.stream_name, &config.group)
            .await?;

        tracing::info!(
            stream = %config.stream_name,
            group = %config.group,
            consumer = %config.consumer,
            handler = %handler.name(),
            "Stream worker created"
        );

        Ok(StreamWorker {
            store,
            handoff: Arc::new(Handoff::new()),
            stop: CancellationToken::new(),
            config: Arc::new(config),
            handler,
            state: AtomicU8::new(Lifecycle::NotStarted as u8),
            loop_handle: Mutex::new(None),
        })
    }

    /// Spawns the consumer loop
    ///
    /// Idempotent; does nothing once started or after shutdown began.
    pub fn start(&self) {
        let mut handle = self.loop_handle();

        if self
            .state
            .compare_exchange(
                Lifecycle::NotStarted as u8,
                Lifecycle::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let consumer = ConsumerLoop {
            store: self.store.clone(),
            handoff: self.handoff.clone(),
            stop: self.stop.clone(),
            config: self.config.clone(),
        };

        *handle = Some(tokio::spawn(consumer.run()));
    }

    /// Current lifecycle
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Stream settings
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn loop_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decodes a handed-off entry
    ///
    /// An undecodable entry yields an empty task; it has already been
    /// acknowledged by the time this runs.
    fn decode(&self, entry: StreamEntry) -> TaskMessage {
        match decode_fields(&entry.fields) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(
                    stream = %self.config.stream_name,
                    entry_id = %entry.id,
                    error = %e,
                    "Failed to decode task, returning empty task"
                );
                TaskMessage::default()
            }
        }
    }
}

#[async_trait]
impl QueueWorker for StreamWorker {
    async fn queue(&self, task: &TaskMessage) -> Result<String, WorkerError> {
        if self.lifecycle() >= Lifecycle::Stopping {
            return Err(WorkerError::QueueShutdown);
        }

        let fields = encode_fields(task)?;
        let id = self
            .store
            .add(&self.config.stream_name, &fields, self.config.max_length)
            .await?;

        tracing::debug!(
            stream = %self.config.stream_name,
            entry_id = %id,
            task_id = %task.id,
            "Task queued"
        );

        Ok(id)
    }

    async fn request(&self) -> Result<TaskMessage, WorkerError> {
        self.start();

        for attempt in 1..=REQUEST_MAX_ATTEMPTS {
            match self.handoff.take(REQUEST_POLL_INTERVAL).await {
                Take::Item(entry) => return Ok(self.decode(entry)),
                Take::Closed => return Err(WorkerError::QueueHasBeenClosed),
                Take::TimedOut => {
                    tracing::trace!(attempt, "No entry handed off yet");
                }
            }
        }

        Err(WorkerError::NoTaskInQueue)
    }

    async fn run(&self, cancel_token: CancellationToken, task: TaskMessage) -> Result<(), WorkerError> {
        let task_id = task.id;
        let enforcer = TimeoutEnforcer::from_task_timeout(task.timeout_secs);
        let task_token = cancel_token.child_token();
        let context = TaskContext::new(task_id, task_token.clone());

        tracing::debug!(task_id = %task_id, handler = %self.handler.name(), "Running task");

        match enforcer
            .run(task_id, &task_token, self.handler.handle(context, task))
            .await
        {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                tracing::error!(task_id = %task_id, error = %e, "Task failed");
                Err(e.into())
            }
            None => Err(WorkerError::Timeout(enforcer.timeout())),
        }
    }

    async fn shutdown(&self) -> Result<(), WorkerError> {
        let began = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state < Lifecycle::Stopping as u8).then_some(Lifecycle::Stopping as u8)
            });
        if began.is_err() {
            return Err(WorkerError::QueueShutdown);
        }

        tracing::info!(stream = %self.config.stream_name, "Shutting down worker");

        self.stop.cancel();

        let handle = self.loop_handle().take();
        if let Some(handle) = handle {
            join_loop(handle, SHUTDOWN_GRACE).await;
        }

        self.store.close().await;
        self.handoff.close();
        self.state.store(Lifecycle::Stopped as u8, Ordering::SeqCst);

        tracing::info!(stream = %self.config.stream_name, "Worker shut down");
        Ok(())
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        let handle = self
            .loop_handle
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        // Claimed entries stay pending in the store
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// How the consumer loop ended during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// Returned on its own
    Finished,

    /// Panicked or was cancelled
    Failed,

    /// Still running after the grace period and aborted
    Aborted,
}

/// Waits up to `grace` for the consumer loop, aborting it past that
async fn join_loop(mut handle: JoinHandle<()>, grace: Duration) -> LoopExit {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => {
            tracing::debug!("Consumer loop finished");
            LoopExit::Finished
        }
        Ok(Err(e)) => {
            tracing::error!(
                error = %e,
                panicked = e.is_panic(),
                "Consumer loop terminated abnormally"
            );
            LoopExit::Failed
        }
        Err(_) => {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Consumer loop did not finish in time, aborting"
            );
            handle.abort();
            LoopExit::Aborted
        }
    }
}

/// Background consumer loop state
struct ConsumerLoop {
    store: Arc<dyn StreamStore>,
    handoff: Arc<Handoff<StreamEntry>>,
    stop: CancellationToken,
    config: Arc<StreamConfig>,
}

impl ConsumerLoop {
    async fn run(self) {
        let config = &self.config;

        tracing::info!(
            stream = %config.stream_name,
            group = %config.group,
            consumer = %config.consumer,
            "Consumer loop started"
        );

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            let read = tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,
                result = self.store.read_group(
                    &config.stream_name,
                    &config.group,
                    &config.consumer,
                    1,
                    config.block_time,
                ) => result,
            };

            let entries = match read {
                Ok(entries) if entries.is_empty() => {
                    tracing::debug!(stream = %config.stream_name, "No new entries");
                    continue;
                }
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(stream = %config.stream_name, error = %e, "Failed to read from stream");
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let mut entries = entries.into_iter();
            while let Some(entry) = entries.next() {
                let id = entry.id.clone();

                match self.handoff.offer(entry, &self.stop).await {
                    Offer::Accepted => self.ack(&id).await,
                    Offer::Stopped(entry) => {
                        self.requeue(std::iter::once(entry).chain(entries)).await;
                        tracing::info!(stream = %config.stream_name, "Consumer loop stopped");
                        return;
                    }
                }
            }
        }

        tracing::info!(stream = %config.stream_name, "Consumer loop stopped");
    }

    async fn ack(&self, id: &str) {
        let config = &self.config;

        if let Err(e) = self.store.ack(&config.stream_name, &config.group, id).await {
            tracing::error!(
                stream = %config.stream_name,
                group = %config.group,
                entry_id = %id,
                error = %e,
                "Failed to acknowledge entry"
            );
        }
    }

    /// Adds undelivered entries back to the stream
    ///
    /// The originals are left pending.
    async fn requeue(&self, entries: impl Iterator<Item = StreamEntry>) {
        let config = &self.config;

        for entry in entries {
            match self
                .store
                .add(&config.stream_name, &entry.fields, config.max_length)
                .await
            {
                Ok(new_id) => tracing::info!(
                    stream = %config.stream_name,
                    entry_id = %entry.id,
                    new_entry_id = %new_id,
                    "Requeued undelivered entry"
                ),
                Err(e) => tracing::error!(
                    stream = %config.stream_name,
                    entry_id = %entry.id,
                    error = %e,
                    "Failed to requeue entry"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, LogHandler};
    use serde_json::json;
    use streamtask_shared::MemoryStore;

    fn test_config() -> StreamConfig {
        StreamConfig::new("test:stream", "test-group", "test-consumer")
            .with_block_time(Duration::from_millis(100))
    }

    async fn test_worker(store: Arc<MemoryStore>) -> StreamWorker {
        StreamWorker::new(store, test_config(), Arc::new(LogHandler))
            .await
            .unwrap()
    }

    #[test]
    fn test_lifecycle_ordering() {
        assert!(Lifecycle::NotStarted < Lifecycle::Running);
        assert!(Lifecycle::Running < Lifecycle::Stopping);
        assert!(Lifecycle::Stopping < Lifecycle::Stopped);
        assert_eq!(Lifecycle::from_u8(2), Lifecycle::Stopping);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(WorkerError::NoTaskInQueue.to_string(), "no task in queue");
        assert_eq!(
            WorkerError::QueueHasBeenClosed.to_string(),
            "queue has been closed"
        );
        assert_eq!(
            WorkerError::QueueShutdown.to_string(),
            "queue has been shut down"
        );
    }

    #[tokio::test]
    async fn test_new_creates_group() {
        let store = Arc::new(MemoryStore::new());
        let worker = test_worker(store.clone()).await;

        assert_eq!(worker.lifecycle(), Lifecycle::NotStarted);
        assert!(store.pending("test:stream", "test-group").is_empty());
    }

    #[tokio::test]
    async fn test_new_fails_on_closed_store() {
        let store = Arc::new(MemoryStore::new());
        store.close().await;

        let result = StreamWorker::new(store, test_config(), Arc::new(LogHandler)).await;
        assert!(matches!(result, Err(WorkerError::Store(StoreError::Closed))));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let worker = test_worker(store).await;

        worker.start();
        worker.start();
        assert_eq!(worker.lifecycle(), Lifecycle::Running);

        worker.shutdown().await.unwrap();
        assert_eq!(worker.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_start_after_shutdown_does_nothing() {
        let store = Arc::new(MemoryStore::new());
        let worker = test_worker(store).await;

        worker.shutdown().await.unwrap();
        worker.start();

        assert_eq!(worker.lifecycle(), Lifecycle::Stopped);
        assert!(worker.loop_handle().is_none());
    }

    #[tokio::test]
    async fn test_queue_then_request() {
        let store = Arc::new(MemoryStore::new());
        let worker = test_worker(store.clone()).await;

        let task = TaskMessage::new(json!({"id": 1}));
        worker.queue(&task).await.unwrap();

        let received = worker.request().await.unwrap();
        assert_eq!(received, task);

        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_entry_yields_empty_task() {
        let store = Arc::new(MemoryStore::new());
        let worker = test_worker(store.clone()).await;

        let mut fields = streamtask_shared::Fields::new();
        fields.insert("body".to_string(), "not json".to_string());
        store.add("test:stream", &fields, 0).await.unwrap();

        let received = worker.request().await.unwrap();
        assert_eq!(received, TaskMessage::default());

        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_shutdown_fails() {
        let store = Arc::new(MemoryStore::new());
        let worker = test_worker(store.clone()).await;

        worker.shutdown().await.unwrap();
        assert!(matches!(
            worker.shutdown().await,
            Err(WorkerError::QueueShutdown)
        ));
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_queue_after_shutdown_fails() {
        let store = Arc::new(MemoryStore::new());
        let worker = test_worker(store.clone()).await;

        worker.shutdown().await.unwrap();

        let result = worker.queue(&TaskMessage::new(json!("late"))).await;
        assert!(matches!(result, Err(WorkerError::QueueShutdown)));
    }

    #[tokio::test]
    async fn test_request_after_shutdown_is_closed() {
        let store = Arc::new(MemoryStore::new());
        let worker = test_worker(store).await;

        worker.shutdown().await.unwrap();
        assert!(matches!(
            worker.request().await,
            Err(WorkerError::QueueHasBeenClosed)
        ));
    }

    #[tokio::test]
    async fn test_run_delegates_to_handler() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_fn("fail-on-bad", |_ctx, task| async move {
            if task.body == json!("bad") {
                Err(HandlerError::Failed("bad task".to_string()))
            } else {
                Ok(())
            }
        });
        let worker = StreamWorker::new(store, test_config(), Arc::new(handler))
            .await
            .unwrap();

        let token = CancellationToken::new();
        assert!(worker
            .run(token.clone(), TaskMessage::new(json!("good")))
            .await
            .is_ok());
        assert!(matches!(
            worker.run(token, TaskMessage::new(json!("bad"))).await,
            Err(WorkerError::Handler(HandlerError::Failed(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_fn("stuck", |ctx: TaskContext, _task| async move {
            ctx.cancelled().await;
            Ok(())
        });
        let worker = StreamWorker::new(store, test_config(), Arc::new(handler))
            .await
            .unwrap();

        let task = TaskMessage::new(json!("slow")).with_timeout_secs(2);
        let result = worker.run(CancellationToken::new(), task).await;

        assert!(matches!(
            result,
            Err(WorkerError::Timeout(timeout)) if timeout == Duration::from_secs(2)
        ));
    }

    #[tokio::test]
    async fn test_run_observes_parent_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_fn("cancellable", |ctx: TaskContext, _task| async move {
            ctx.cancelled().await;
            Err(HandlerError::Cancelled)
        });
        let worker = StreamWorker::new(store, test_config(), Arc::new(handler))
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let result = worker.run(token, TaskMessage::new(json!("x"))).await;
        assert!(matches!(
            result,
            Err(WorkerError::Handler(HandlerError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_join_loop_finished() {
        let handle = tokio::spawn(async {});
        assert_eq!(join_loop(handle, SHUTDOWN_GRACE).await, LoopExit::Finished);
    }

    #[tokio::test]
    async fn test_join_loop_reports_panic() {
        let handle = tokio::spawn(async { panic!("consumer loop failure") });
        assert_eq!(join_loop(handle, SHUTDOWN_GRACE).await, LoopExit::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_loop_aborts_after_grace() {
        let handle = tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)));
        let started = tokio::time::Instant::now();

        assert_eq!(join_loop(handle, SHUTDOWN_GRACE).await, LoopExit::Aborted);
        assert!(started.elapsed() >= SHUTDOWN_GRACE);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    /// Store whose group reads panic
    struct PanickingStore(MemoryStore);

    #[async_trait]
    impl StreamStore for PanickingStore {
        async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
            self.0.create_group(stream, group).await
        }

        async fn read_group(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _count: usize,
            _block: Duration,
        ) -> Result<Vec<StreamEntry>, StoreError> {
            panic!("read_group failure")
        }

        async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
            self.0.ack(stream, group, id).await
        }

        async fn add(
            &self,
            stream: &str,
            fields: &streamtask_shared::Fields,
            max_len: usize,
        ) -> Result<String, StoreError> {
            self.0.add(stream, fields, max_len).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }

        async fn close(&self) {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_after_consumer_loop_panic() {
        let store = Arc::new(PanickingStore(MemoryStore::new()));
        let worker = StreamWorker::new(store.clone(), test_config(), Arc::new(LogHandler))
            .await
            .unwrap();

        worker.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        worker.shutdown().await.unwrap();
        assert_eq!(worker.lifecycle(), Lifecycle::Stopped);
        assert!(store.0.is_closed());
    }
}
