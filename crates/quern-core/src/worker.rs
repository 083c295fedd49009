use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tracing::{debug, instrument, warn};

use crate::{
    error::TaskError,
    events::{Event, EventKind},
    pool::Shared,
    task::{Task, TaskOutcome, TaskOutput, TaskStatus},
};

/// Consumes the pool queue until it is closed and empty.
pub(crate) async fn worker_loop(worker: usize, shared: Arc<Shared>) {
    debug!(worker, "worker started");

    while let Some(task) = shared.queue.dequeue().await {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);

        let guard = InFlight {
            worker,
            shared: &shared,
            task: &task,
            runs: Arc::new(AtomicU32::new(0)),
            reported: false,
        };
        let (status, result) = process(worker, &shared, &task, &guard.runs).await;
        guard.complete(status, result);
    }

    debug!(worker, "worker exiting");
}

#[instrument(level = "debug", skip_all, fields(task_id = %task.id()))]
async fn process(
    worker: usize,
    shared: &Shared,
    task: &Task,
    runs: &Arc<AtomicU32>,
) -> (TaskStatus, Result<TaskOutput, TaskError>) {
    let timeout = task
        .timeout()
        .or(shared.config.default_timeout())
        .unwrap_or_default();
    let (scope, _release) = shared.root.child(timeout);

    if let Some(err) = scope.err() {
        return (TaskStatus::Dropped, Err(err.into()));
    }

    shared.hooks.emit(
        Event::now(EventKind::TaskStarted)
            .with_task(task.id())
            .with_worker(worker),
    );

    let breaker = &shared.breaker;
    let attempted = shared
        .retry
        .run_observed(
            &scope,
            |attempt| {
                let scope = scope.clone();
                let runs = Arc::clone(runs);
                async move {
                    breaker
                        .execute(&scope, || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            task.invoke(scope.clone(), attempt)
                        })
                        .await
                }
            },
            |notice| {
                shared.hooks.emit(
                    Event::now(EventKind::RetryScheduled)
                        .with_task(task.id())
                        .with_worker(worker)
                        .with_attempt(notice.attempt)
                        .with_delay(notice.delay)
                        .with_error(notice.error.to_string()),
                );
            },
        )
        .await;

    let body_ran = runs.load(Ordering::SeqCst) > 0;
    let status = match &attempted.result {
        Ok(_) => TaskStatus::Succeeded,
        Err(err) if err.is_cancellation() && !body_ran => TaskStatus::Dropped,
        Err(err) if err.is_cancellation() => TaskStatus::FailedPermanent,
        Err(err) if shared.retry.policy().is_retryable(err) => TaskStatus::FailedRetriesExhausted,
        Err(_) => TaskStatus::FailedPermanent,
    };

    (status, attempted.result)
}

/// Tracks one dequeued task until its outcome is reported.
///
/// If the worker is aborted mid-task the outcome is reported on drop as
/// cancelled.
struct InFlight<'a> {
    worker: usize,
    shared: &'a Shared,
    task: &'a Task,
    runs: Arc<AtomicU32>,
    reported: bool,
}

impl InFlight<'_> {
    fn complete(mut self, status: TaskStatus, result: Result<TaskOutput, TaskError>) {
        self.reported = true;

        let (output, last_error) = match result {
            Ok(output) => (Some(output), None),
            Err(err) => (None, Some(err)),
        };
        match &last_error {
            None => debug!(task_id = %self.task.id(), %status, "task finished"),
            Some(err) => debug!(
                task_id = %self.task.id(),
                %status,
                error = err.as_label(),
                "task finished"
            ),
        }

        self.report(status, output, last_error);
    }

    fn report(&self, status: TaskStatus, output: Option<TaskOutput>, last_error: Option<TaskError>) {
        let outcome = TaskOutcome {
            task_id: self.task.id().clone(),
            status,
            attempts: self.runs.load(Ordering::SeqCst),
            total_latency: self
                .task
                .enqueued_at()
                .map(|at| at.elapsed())
                .unwrap_or_default(),
            last_error,
            output,
            priority: self.task.priority(),
        };

        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.shared.report(Some(self.worker), outcome);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.reported {
            return;
        }

        let status = if self.runs.load(Ordering::SeqCst) > 0 {
            TaskStatus::FailedPermanent
        } else {
            TaskStatus::Dropped
        };
        warn!(task_id = %self.task.id(), worker = self.worker, %status, "task abandoned");
        self.report(status, None, Some(TaskError::Canceled));
    }
}
