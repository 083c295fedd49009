//! Lifecycle events. Observers run synchronously on the emitting thread, in
//! registration order.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, SystemTime},
};

use tracing::warn;

use crate::{TaskId, breaker::BreakerTransition, error::panic_message, task::TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Task accepted into the queue.
    TaskEnqueued,
    /// `submit` refused the task.
    TaskRejected,
    /// A worker picked the task up.
    TaskStarted,
    /// An attempt failed and another one is scheduled after `delay`.
    RetryScheduled,
    TaskSucceeded,
    /// Terminal failure (permanent or retries exhausted).
    TaskFailed,
    /// Terminal: the task never ran its body.
    TaskDropped,
    BreakerStateChanged,
    /// Intake closed; the pool is draining.
    ShutdownRequested,
    /// Workers finished within the grace period.
    DrainCompleted,
    /// Grace period exceeded; the root scope was cancelled.
    ForceCancelled,
    PoolStopped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskEnqueued => "task_enqueued",
            EventKind::TaskRejected => "task_rejected",
            EventKind::TaskStarted => "task_started",
            EventKind::RetryScheduled => "retry_scheduled",
            EventKind::TaskSucceeded => "task_succeeded",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskDropped => "task_dropped",
            EventKind::BreakerStateChanged => "breaker_state_changed",
            EventKind::ShutdownRequested => "shutdown_requested",
            EventKind::DrainCompleted => "drain_completed",
            EventKind::ForceCancelled => "force_cancelled",
            EventKind::PoolStopped => "pool_stopped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle event. Optional fields are filled in per kind.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub at: SystemTime,
    pub task_id: Option<TaskId>,
    pub worker: Option<usize>,
    pub attempt: Option<u32>,
    pub delay: Option<Duration>,
    pub error: Option<String>,
    pub outcome: Option<Arc<TaskOutcome>>,
    pub transition: Option<BreakerTransition>,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            at: SystemTime::now(),
            task_id: None,
            worker: None,
            attempt: None,
            delay: None,
            error: None,
            outcome: None,
            transition: None,
        }
    }

    pub fn with_task(mut self, id: &TaskId) -> Self {
        self.task_id = Some(id.clone());
        self
    }

    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_outcome(mut self, outcome: TaskOutcome) -> Self {
        self.outcome = Some(Arc::new(outcome));
        self
    }

    pub fn with_transition(mut self, transition: BreakerTransition) -> Self {
        self.transition = Some(transition);
        self
    }

    /// `true` for the three terminal task events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::TaskSucceeded | EventKind::TaskFailed | EventKind::TaskDropped
        )
    }
}

/// Receives pool events. Implementations must be cheap: they run inline on
/// worker threads.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event);

    fn name(&self) -> &str {
        "observer"
    }
}

/// Adapts a closure into an observer that only sees terminal outcomes.
pub(crate) struct OutcomeCallback<F>(pub(crate) F);

impl<F> Observer for OutcomeCallback<F>
where
    F: Fn(&TaskOutcome) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        if let Some(outcome) = &event.outcome {
            (self.0)(outcome);
        }
    }

    fn name(&self) -> &str {
        "on_outcome"
    }
}

/// Registered observers.
#[derive(Default)]
pub struct Hooks {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("observers", &self.len())
            .finish()
    }
}

impl Hooks {
    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, event: Event) {
        // Snapshot so observers may subscribe from inside a callback.
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for observer in observers {
            let res = std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if let Err(panic) = res {
                warn!(
                    observer = observer.name(),
                    event = %event.kind,
                    panic = %panic_message(&*panic),
                    "observer panicked"
                );
            }
        }
    }
}
