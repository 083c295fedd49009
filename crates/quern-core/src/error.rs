use std::time::Duration;

use thiserror::Error;

use crate::TaskId;

/// Reason a [`Scope`](crate::Scope) is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// The scope or one of its ancestors was cancelled explicitly.
    #[error("context canceled")]
    Canceled,

    /// The scope's deadline (or an inherited one) has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Errors produced by a task attempt, the retry executor or the circuit breaker.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Failure that may go away if the operation is tried again.
    #[error("transient failure: {error}")]
    Transient { error: String },

    /// Failure that will not go away on retry.
    #[error("permanent failure: {error}")]
    Permanent { error: String },

    /// The circuit breaker rejected the call without running it.
    #[error("circuit breaker open; retry after {retry_after:?}")]
    BreakerOpen { retry_after: Duration },

    /// The task's scope was cancelled.
    #[error("context canceled")]
    Canceled,

    /// The task's scope deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The task body panicked.
    #[error("task panicked: {message}")]
    Panicked { message: String },
}

impl TaskError {
    pub fn transient(error: impl Into<String>) -> Self {
        TaskError::Transient {
            error: error.into(),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        TaskError::Permanent {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Transient { .. } => "task_transient",
            TaskError::Permanent { .. } => "task_permanent",
            TaskError::BreakerOpen { .. } => "breaker_open",
            TaskError::Canceled => "task_canceled",
            TaskError::DeadlineExceeded => "task_deadline_exceeded",
            TaskError::Panicked { .. } => "task_panicked",
        }
    }

    /// `true` for [`TaskError::Canceled`] and [`TaskError::DeadlineExceeded`].
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Canceled | TaskError::DeadlineExceeded)
    }

    /// Default retry classifier: transient failures and breaker rejections.
    ///
    /// Cancellation and panics are never retryable, whatever classifier a
    /// [`RetryPolicy`](crate::RetryPolicy) is configured with.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::Transient { .. } | TaskError::BreakerOpen { .. }
        )
    }

    /// Whether this error says something about the downstream dependency's health.
    pub(crate) fn counts_against_breaker(&self) -> bool {
        !matches!(
            self,
            TaskError::Canceled | TaskError::DeadlineExceeded | TaskError::BreakerOpen { .. }
        )
    }
}

impl From<ScopeError> for TaskError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::Canceled => TaskError::Canceled,
            ScopeError::DeadlineExceeded => TaskError::DeadlineExceeded,
        }
    }
}

/// Rejections returned synchronously by [`WorkerPool::submit`](crate::WorkerPool::submit).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("pool is closed")]
    PoolClosed,

    #[error("task {0} is already queued or running")]
    DuplicateTaskId(TaskId),
}

impl SubmitError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SubmitError::QueueFull { .. } => "queue_full",
            SubmitError::PoolClosed => "pool_closed",
            SubmitError::DuplicateTaskId(_) => "duplicate_task_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("environment variable {var} has invalid value {value:?}")]
    Env { var: String, value: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Shutdown finished, but only after force-cancelling the root scope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    #[error("shutdown grace {grace:?} exceeded; force-cancelled {unfinished} unfinished task(s)")]
    Forced { grace: Duration, unfinished: usize },
}

impl ShutdownError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ShutdownError::Forced { .. } => "shutdown_forced",
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
