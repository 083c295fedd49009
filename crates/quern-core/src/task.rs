use std::{
    fmt::{self, Display},
    future::Future,
    sync::Arc,
    time::Duration,
};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{TaskId, error::TaskError, scope::Scope};

/// Opaque, caller-defined input shared read-only by every attempt.
pub type Payload = Arc<[u8]>;

/// Opaque, caller-defined result of a successful run.
pub type TaskOutput = Vec<u8>;

pub type TaskFuture = BoxFuture<'static, Result<TaskOutput, TaskError>>;

type RunFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// What a task body receives on every attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Done when the task's timeout elapses or the pool force-cancels.
    pub scope: Scope,
    pub payload: Payload,
}

/// A unit of work.
///
/// The body is a closure producing a fresh future per attempt:
///
/// ```rust
/// use quern_core::{Task, TaskError};
///
/// let task = Task::new("resize-42", |ctx| async move {
///     if ctx.scope.is_done() {
///         return Err(TaskError::Canceled);
///     }
///     Ok(ctx.payload.to_vec())
/// })
/// .with_payload(b"image bytes".to_vec());
///
/// assert_eq!(task.id().as_str(), "resize-42");
/// ```
#[derive(Clone)]
pub struct Task {
    id: TaskId,
    payload: Payload,
    run: RunFn,
    priority: i32,
    timeout: Option<Duration>,
    enqueued_at: Option<Instant>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new<F, Fut>(id: impl Into<TaskId>, run: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            payload: Arc::from(Vec::new()),
            run: Arc::new(move |ctx| Box::pin(run(ctx))),
            priority: 0,
            timeout: None,
            enqueued_at: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Informational; carried into events and outcomes. The queue is FIFO.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the pool's default per-task timeout (`Duration::ZERO` = none).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set when the pool accepts the task.
    pub fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at
    }

    pub(crate) fn mark_enqueued(&mut self, at: Instant) {
        self.enqueued_at = Some(at);
    }

    pub(crate) fn invoke(&self, scope: Scope, attempt: u32) -> TaskFuture {
        (self.run)(TaskContext {
            task_id: self.id.clone(),
            attempt,
            scope,
            payload: Arc::clone(&self.payload),
        })
    }
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Succeeded,
    /// Non-retryable error, panic, or cancellation after the body started.
    FailedPermanent,
    /// Every allowed attempt failed with a retryable error.
    FailedRetriesExhausted,
    /// Cancelled before the body ever ran.
    Dropped,
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Succeeded => "Succeeded",
            TaskStatus::FailedPermanent => "FailedPermanent",
            TaskStatus::FailedRetriesExhausted => "FailedRetriesExhausted",
            TaskStatus::Dropped => "Dropped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Succeeded)
    }
}

/// Final report for one task. Built once by the worker, then shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Number of times the task body was invoked.
    pub attempts: u32,
    /// From acceptance by `submit` to the terminal outcome.
    pub total_latency: Duration,
    pub last_error: Option<TaskError>,
    pub output: Option<TaskOutput>,
    pub priority: i32,
}

impl TaskOutcome {
    pub(crate) fn dropped(task: &Task, error: TaskError) -> Self {
        Self {
            task_id: task.id.clone(),
            status: TaskStatus::Dropped,
            attempts: 0,
            total_latency: task.enqueued_at.map(|t| t.elapsed()).unwrap_or_default(),
            last_error: Some(error),
            output: None,
            priority: task.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invoke_passes_context_to_body() {
        let task = Task::new("echo", |ctx| async move {
            let mut out = ctx.payload.to_vec();
            out.push(ctx.attempt as u8);
            Ok(out)
        })
        .with_payload(vec![7u8, 8]);

        let out = task.invoke(Scope::background(), 3).await.unwrap();
        assert_eq!(out, vec![7, 8, 3]);
    }

    #[test]
    fn defaults() {
        let task = Task::new(TaskId::new(), |_| async { Ok(Vec::new()) });
        assert_eq!(task.priority(), 0);
        assert!(task.timeout().is_none());
        assert!(task.enqueued_at().is_none());
        assert!(task.payload().is_empty());
    }

    #[test]
    fn status_labels() {
        assert_eq!(TaskStatus::FailedRetriesExhausted.to_string(), "FailedRetriesExhausted");
        assert!(TaskStatus::Succeeded.is_success());
        assert!(!TaskStatus::Dropped.is_success());
    }
}
