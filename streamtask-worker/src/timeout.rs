/// Timeout handling for task execution
///
/// Each task can carry a `timeout_secs`. If the handler exceeds it, the task's
/// cancellation token fires, the handler gets a grace period to wind down, and
/// the run is reported as timed out whatever the handler returns afterwards.
///
/// # Timeout Behavior
///
/// 1. **Graceful timeout**: Handler's cancel token fires at timeout
/// 2. **Grace period**: 30 seconds for the handler to clean up
/// 3. **Abandon**: The handler future is dropped after the grace period
///
/// # Default Timeouts
///
/// - No timeout specified: 1 hour (3600 seconds)
/// - Minimum timeout: 1 second
/// - Maximum timeout: 24 hours (86400 seconds)
///
/// # Example
///
/// ```no_run
/// use streamtask_worker::timeout::TimeoutEnforcer;
/// use tokio_util::sync::CancellationToken;
/// use uuid::Uuid;
///
/// # async fn example() {
/// let enforcer = TimeoutEnforcer::from_task_timeout(Some(300));
/// let cancel_token = CancellationToken::new();
///
/// let outcome = enforcer
///     .run(Uuid::new_v4(), &cancel_token, async { "done" })
///     .await;
/// assert_eq!(outcome, Some("done"));
/// # }
/// ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default timeout duration (1 hour)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Grace period after timeout for cleanup (30 seconds)
pub const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Minimum allowed timeout (1 second)
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum allowed timeout (24 hours)
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86400);

/// Timeout enforcer
///
/// Enforces timeouts on task execution by cancelling tasks that exceed
/// their configured timeout duration.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutEnforcer {
    /// Timeout duration
    timeout: Duration,

    /// Grace period for cleanup
    grace_period: Duration,
}

impl TimeoutEnforcer {
    /// Creates a new timeout enforcer
    pub fn new(timeout: Duration) -> Self {
        TimeoutEnforcer {
            timeout,
            grace_period: GRACE_PERIOD,
        }
    }

    /// Creates a new timeout enforcer with custom grace period
    pub fn with_grace_period(timeout: Duration, grace_period: Duration) -> Self {
        TimeoutEnforcer {
            timeout,
            grace_period,
        }
    }

    /// Creates a timeout enforcer from a task's timeout_secs
    ///
    /// # Arguments
    ///
    /// * `timeout_secs` - Timeout in seconds (None = default)
    pub fn from_task_timeout(timeout_secs: Option<u64>) -> Self {
        let timeout = match timeout_secs {
            Some(secs) => Duration::from_secs(secs).clamp(MIN_TIMEOUT, MAX_TIMEOUT),
            None => DEFAULT_TIMEOUT,
        };

        TimeoutEnforcer::new(timeout)
    }

    /// Runs `fut` under the timeout
    ///
    /// Returns `Some(output)` if the future completes within the timeout.
    /// Otherwise cancels `cancel_token`, waits up to the grace period for the
    /// future to finish, and returns `None`.
    pub async fn run<F>(&self, task_id: Uuid, cancel_token: &CancellationToken, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::pin!(fut);

        tokio::select! {
            output = &mut fut => return Some(output),
            _ = sleep(self.timeout) => {}
        }

        tracing::warn!(
            task_id = %task_id,
            timeout_secs = self.timeout.as_secs(),
            "Task timeout reached, sending cancellation signal"
        );

        // Send graceful cancellation
        cancel_token.cancel();

        if tokio::time::timeout(self.grace_period, fut).await.is_err() {
            tracing::warn!(
                task_id = %task_id,
                "Grace period expired, abandoning task"
            );
        }

        None
    }

    /// Gets the timeout duration
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Gets the grace period
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}
