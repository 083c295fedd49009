//! Shutdown coordination: drain within the grace period, then cancel the root
//! scope, wait out the force window and abort whatever is left. The pool
//! always ends up `Stopped`.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use tokio::{task::JoinSet, time::timeout};
use tracing::{info, warn};

use crate::{
    error::{ShutdownError, TaskError},
    events::{Event, EventKind},
    pool::Shared,
    task::TaskOutcome,
};

pub(crate) struct ShutdownCoordinator {
    shared: Arc<Shared>,
    workers: JoinSet<()>,
}

impl ShutdownCoordinator {
    pub(crate) fn new(shared: Arc<Shared>, workers: JoinSet<()>) -> Self {
        Self { shared, workers }
    }

    pub(crate) async fn run(mut self, grace: Duration) {
        let result = self.drain(grace).await;
        self.shared.finish(result);
    }

    async fn drain(&mut self, grace: Duration) -> Result<(), ShutdownError> {
        let drained = timeout(grace, join_all(&mut self.workers)).await;
        if drained.is_ok() {
            info!("all workers drained within grace period");
            self.shared.hooks.emit(Event::now(EventKind::DrainCompleted));
            return Ok(());
        }

        let unfinished = self.shared.in_flight.load(Ordering::SeqCst) + self.shared.queue.len();
        warn!(
            grace_ms = grace.as_millis() as u64,
            unfinished, "grace period exceeded; force-cancelling"
        );
        self.shared.root_guard.cancel();
        self.shared
            .hooks
            .emit(Event::now(EventKind::ForceCancelled).with_delay(grace));

        let force_window = self.shared.config.force_window;
        if timeout(force_window, join_all(&mut self.workers))
            .await
            .is_err()
        {
            warn!(
                workers = self.workers.len(),
                "workers ignored cancellation; aborting"
            );
            self.workers.abort_all();
            // A body blocking its thread only observes the abort once it
            // yields. Its in-flight guard reports the task at that point.
            if timeout(force_window, join_all(&mut self.workers))
                .await
                .is_err()
            {
                warn!(
                    workers = self.workers.len(),
                    "workers still running after abort; detaching"
                );
                self.workers.detach_all();
            }
        }

        for task in self.shared.queue.drain_remaining().await {
            self.shared
                .report(None, TaskOutcome::dropped(&task, TaskError::Canceled));
        }

        Err(ShutdownError::Forced { grace, unfinished })
    }
}

async fn join_all(set: &mut JoinSet<()>) {
    while set.join_next().await.is_some() {}
}

/// Completes when the process receives a termination signal.
///
/// Unix: SIGINT, SIGTERM or SIGQUIT. Elsewhere: Ctrl-C.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
