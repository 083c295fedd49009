use std::sync::atomic::{AtomicU64, Ordering};

use quern_core::{Event, EventKind, Observer, TaskStatus};
use serde::Serialize;

/// Running totals for one pool.
#[derive(Debug, Default)]
pub struct OutcomeStats {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    succeeded: AtomicU64,
    failed_permanent: AtomicU64,
    retries_exhausted: AtomicU64,
    dropped: AtomicU64,
    breaker_trips: AtomicU64,
}

/// Point-in-time copy of [`OutcomeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub rejected: u64,
    pub retries: u64,
    pub succeeded: u64,
    pub failed_permanent: u64,
    pub retries_exhausted: u64,
    pub dropped: u64,
    pub breaker_trips: u64,
}

impl StatsSnapshot {
    /// Tasks with a terminal outcome.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed_permanent + self.retries_exhausted + self.dropped
    }
}

impl OutcomeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed_permanent: self.failed_permanent.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
        }
    }
}

impl Observer for OutcomeStats {
    fn on_event(&self, e: &Event) {
        let counter = match e.kind {
            EventKind::TaskEnqueued => &self.enqueued,
            EventKind::TaskRejected => &self.rejected,
            EventKind::RetryScheduled => &self.retries,
            EventKind::BreakerStateChanged => match e.transition {
                Some(t) if t.to == quern_core::BreakerState::Open => &self.breaker_trips,
                _ => return,
            },
            _ => match e.outcome.as_ref().map(|o| o.status) {
                Some(TaskStatus::Succeeded) => &self.succeeded,
                Some(TaskStatus::FailedPermanent) => &self.failed_permanent,
                Some(TaskStatus::FailedRetriesExhausted) => &self.retries_exhausted,
                Some(TaskStatus::Dropped) => &self.dropped,
                None => return,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        "outcome_stats"
    }
}
