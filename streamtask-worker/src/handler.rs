/// Task handler contract
///
/// `Run` on the worker delegates to a [`TaskHandler`]. Handlers receive the
/// decoded [`TaskMessage`] together with a [`TaskContext`] carrying a
/// cancellation token, which fires when the task's timeout is reached.
///
/// # Handler Contract
///
/// All handlers must:
/// 1. Implement the `TaskHandler` trait (async)
/// 2. Check the cancel token in long-running work and return promptly when
///    it fires
/// 3. Return `Err` only for failures the host should see
///
/// # Example
///
/// ```no_run
/// use streamtask_worker::handler::{TaskContext, TaskHandler, HandlerResult};
/// use streamtask_shared::TaskMessage;
/// use async_trait::async_trait;
///
/// struct EmailHandler;
///
/// #[async_trait]
/// impl TaskHandler for EmailHandler {
///     fn name(&self) -> &str {
///         "email"
///     }
///
///     async fn handle(&self, context: TaskContext, task: TaskMessage) -> HandlerResult<()> {
///         if context.is_cancelled() {
///             return Ok(());
///         }
///         println!("sending {}", task.body);
///         Ok(())
///     }
/// }
/// ```

use async_trait::async_trait;
use std::future::Future;
use streamtask_shared::TaskMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handler error types
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Task execution failed
    #[error("Task execution failed: {0}")]
    Failed(String),

    /// Task payload is not what the handler expects
    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    /// Task was cancelled
    #[error("Task was cancelled")]
    Cancelled,
}

/// Handler result type alias
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Task execution context
pub struct TaskContext {
    /// Task ID
    pub task_id: Uuid,

    /// Cancellation token
    pub cancel_token: CancellationToken,
}

impl TaskContext {
    /// Creates a new task context
    pub fn new(task_id: Uuid, cancel_token: CancellationToken) -> Self {
        TaskContext {
            task_id,
            cancel_token,
        }
    }

    /// Checks if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Waits for cancellation
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }
}

/// Core handler trait
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Returns the handler name
    ///
    /// Used for logging.
    fn name(&self) -> &str {
        "handler"
    }

    /// Executes a task
    ///
    /// # Returns
    ///
    /// Ok(()) if the task completed or observed cancellation and stopped,
    /// Err if execution failed
    async fn handle(&self, context: TaskContext, task: TaskMessage) -> HandlerResult<()>;
}

/// Default handler: logs the task and succeeds
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, context: TaskContext, task: TaskMessage) -> HandlerResult<()> {
        tracing::info!(task_id = %context.task_id, body = %task.body, "Task received");
        Ok(())
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wraps an async closure as a [`TaskHandler`]
///
/// # Example
///
/// ```no_run
/// use streamtask_worker::handler::handler_fn;
///
/// let handler = handler_fn("echo", |_ctx, task| async move {
///     println!("{}", task.body);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, TaskMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult<()>> + Send,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, TaskMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, context: TaskContext, task: TaskMessage) -> HandlerResult<()> {
        (self.f)(context, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_handler_error_display() {
        assert_eq!(
            HandlerError::Failed("boom".to_string()).to_string(),
            "Task execution failed: boom"
        );
        assert_eq!(HandlerError::Cancelled.to_string(), "Task was cancelled");
    }

    #[test]
    fn test_task_context_cancellation() {
        let cancel_token = CancellationToken::new();
        let context = TaskContext::new(Uuid::new_v4(), cancel_token.clone());

        assert!(!context.is_cancelled());

        cancel_token.cancel();
        assert!(context.is_cancelled());
    }

    #[tokio::test]
    async fn test_log_handler_succeeds() {
        let context = TaskContext::new(Uuid::new_v4(), CancellationToken::new());
        let result = LogHandler.handle(context, TaskMessage::new(json!({"id": 1}))).await;
        assert!(result.is_ok());
        assert_eq!(LogHandler.name(), "log");
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = {
            let calls = calls.clone();
            handler_fn("count", move |_ctx, task| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if task.body == json!("bad") {
                        return Err(HandlerError::InvalidPayload("bad".to_string()));
                    }
                    Ok(())
                }
            })
        };

        let ctx = || TaskContext::new(Uuid::new_v4(), CancellationToken::new());
        assert!(handler.handle(ctx(), TaskMessage::new(json!("ok"))).await.is_ok());
        assert!(matches!(
            handler.handle(ctx(), TaskMessage::new(json!("bad"))).await,
            Err(HandlerError::InvalidPayload(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler.name(), "count");
    }
}
