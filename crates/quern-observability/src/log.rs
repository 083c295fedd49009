use quern_core::{Event, EventKind, Observer};
use tracing::{debug, info, warn};

/// Logs every pool event as a structured `tracing` record.
///
/// ```text
/// DEBUG task enqueued        task_id=a1
/// INFO  task started         task_id=a1 worker=0
/// WARN  retry scheduled      task_id=a1 worker=0 attempt=1 delay_ms=96 error="transient failure: 503"
/// INFO  task succeeded       task_id=a1 worker=0 attempts=2 latency_ms=131
/// WARN  breaker state changed from=Closed to=Open
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, e: &Event) {
        let task_id = e.task_id.as_ref().map(|id| id.as_str()).unwrap_or("-");

        match e.kind {
            EventKind::TaskEnqueued => debug!(task_id, "task enqueued"),
            EventKind::TaskRejected => {
                warn!(task_id, error = e.error.as_deref().unwrap_or(""), "task rejected")
            }
            EventKind::TaskStarted => info!(task_id, worker = e.worker, "task started"),
            EventKind::RetryScheduled => warn!(
                task_id,
                worker = e.worker,
                attempt = e.attempt,
                delay_ms = e.delay.map(|d| d.as_millis() as u64),
                error = e.error.as_deref().unwrap_or(""),
                "retry scheduled"
            ),
            EventKind::TaskSucceeded => info!(
                task_id,
                worker = e.worker,
                attempts = e.attempt,
                latency_ms = e.outcome.as_ref().map(|o| o.total_latency.as_millis() as u64),
                "task succeeded"
            ),
            EventKind::TaskFailed => warn!(
                task_id,
                worker = e.worker,
                attempts = e.attempt,
                status = e.outcome.as_ref().map(|o| o.status.as_str()).unwrap_or("-"),
                error = e.error.as_deref().unwrap_or(""),
                "task failed"
            ),
            EventKind::TaskDropped => warn!(
                task_id,
                error = e.error.as_deref().unwrap_or(""),
                "task dropped"
            ),
            EventKind::BreakerStateChanged => {
                if let Some(t) = e.transition {
                    warn!(from = %t.from, to = %t.to, "breaker state changed");
                }
            }
            EventKind::ShutdownRequested => info!(
                grace_ms = e.delay.map(|d| d.as_millis() as u64),
                "shutdown requested"
            ),
            EventKind::DrainCompleted => info!("drain completed"),
            EventKind::ForceCancelled => warn!("grace exceeded; in-flight tasks cancelled"),
            EventKind::PoolStopped => info!("pool stopped"),
        }
    }

    fn name(&self) -> &str {
        "tracing"
    }
}
