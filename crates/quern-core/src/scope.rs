//! Cancellable, deadline-bound execution contexts. A child scope is done as
//! soon as its parent is, and deadlines are checked lazily so a scope owns no timer.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ScopeError;

/// Creates a child of `parent` bounded by `timeout` (`Duration::ZERO` = parent only).
///
/// Same as [`Scope::child`].
pub fn new_scope(parent: &Scope, timeout: Duration) -> (Scope, ScopeGuard) {
    parent.child(timeout)
}

/// Cancellable execution context handed to every unit of work.
///
/// Cheap to clone; clones observe the same cancellation.
#[derive(Debug, Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    deadline: Option<Instant>,
    finished: OnceLock<Finished>,
    parent: Option<Scope>,
}

#[derive(Debug, Clone, Copy)]
struct Finished {
    cause: ScopeError,
    at: Instant,
}

impl Scope {
    /// A scope that is never done. Root of every scope tree.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                deadline: None,
                finished: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derives a child scope.
    ///
    /// `timeout = 0` inherits the parent's bounds only. Otherwise the child's
    /// deadline is `now + timeout`, or the parent's deadline if that is earlier.
    pub fn child(&self, timeout: Duration) -> (Scope, ScopeGuard) {
        let own = if timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(timeout)
        };
        self.derive(own)
    }

    /// Derives a child scope that is done at `deadline` at the latest.
    pub fn with_deadline(&self, deadline: Instant) -> (Scope, ScopeGuard) {
        self.derive(Some(deadline))
    }

    fn derive(&self, own: Option<Instant>) -> (Scope, ScopeGuard) {
        let deadline = match (self.inner.deadline, own) {
            (Some(p), Some(o)) => Some(p.min(o)),
            (p, o) => p.or(o),
        };
        let scope = Scope {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                deadline,
                finished: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        };
        let guard = ScopeGuard {
            scope: scope.clone(),
        };
        (scope, guard)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline; `None` when the scope has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.finished().is_some()
    }

    /// `None` while the scope is live; afterwards the reason it finished.
    ///
    /// Once reported, the reason never changes.
    pub fn err(&self) -> Option<ScopeError> {
        self.finished().map(|f| f.cause)
    }

    /// Completes when the scope is done.
    pub async fn done(&self) {
        if self.is_done() {
            return;
        }
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.inner.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.inner.token.cancelled().await,
        }
    }

    /// Whichever of parent-done, own deadline, own cancel happened first wins.
    fn finished(&self) -> Option<Finished> {
        if let Some(f) = self.inner.finished.get() {
            return Some(*f);
        }

        let now = Instant::now();
        let mut first: Option<Finished> = self.inner.parent.as_ref().and_then(Scope::finished);
        if let Some(deadline) = self.inner.deadline.filter(|d| *d <= now) {
            let expired = Finished {
                cause: ScopeError::DeadlineExceeded,
                at: deadline,
            };
            first = Some(match first {
                Some(f) if f.at <= expired.at => f,
                _ => expired,
            });
        }

        first.map(|f| *self.inner.finished.get_or_init(|| f))
    }

    fn cancel(&self) {
        if self.finished().is_none() {
            let _ = self.inner.finished.set(Finished {
                cause: ScopeError::Canceled,
                at: Instant::now(),
            });
        }
        self.inner.token.cancel();
    }
}

/// Release handle for a derived [`Scope`].
///
/// Cancels the scope when dropped. [`ScopeGuard::cancel`] may be called any
/// number of times; only the first call has an effect.
#[derive(Debug)]
#[must_use = "dropping the guard cancels the scope immediately"]
pub struct ScopeGuard {
    scope: Scope,
}

impl ScopeGuard {
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_deadline_exceeded() {
        let root = Scope::background();
        let (scope, _guard) = root.child(Duration::from_millis(100));

        assert!(scope.err().is_none());
        scope.done().await;

        assert_eq!(scope.err(), Some(ScopeError::DeadlineExceeded));
        assert!(root.err().is_none());
    }

    #[tokio::test]
    async fn explicit_cancel_reports_canceled() {
        let root = Scope::background();
        let (scope, guard) = root.child(Duration::from_secs(60));

        guard.cancel();
        scope.done().await;

        assert_eq!(scope.err(), Some(ScopeError::Canceled));
    }

    #[tokio::test]
    async fn parent_cancellation_propagates_down_not_up() {
        let root = Scope::background();
        let (parent, parent_guard) = root.child(Duration::ZERO);
        let (child, child_guard) = parent.child(Duration::ZERO);
        let (sibling, _sibling_guard) = parent.child(Duration::ZERO);

        child_guard.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
        assert!(!sibling.is_done());

        parent_guard.cancel();
        sibling.done().await;
        assert_eq!(sibling.err(), Some(ScopeError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn child_inherits_earlier_parent_deadline() {
        let root = Scope::background();
        let (parent, _pg) = root.child(Duration::from_millis(50));
        let (child, _cg) = parent.child(Duration::from_secs(10));

        assert_eq!(child.deadline(), parent.deadline());
        child.done().await;
        assert_eq!(child.err(), Some(ScopeError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_deadline_keeps_canceled() {
        let root = Scope::background();
        let (scope, guard) = root.child(Duration::from_millis(10));

        guard.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(scope.err(), Some(ScopeError::Canceled));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let root = Scope::background();
        let (scope, guard) = new_scope(&root, Duration::ZERO);

        guard.cancel();
        guard.cancel();
        drop(guard);

        assert_eq!(scope.err(), Some(ScopeError::Canceled));
    }

    #[tokio::test]
    async fn zero_timeout_has_no_deadline() {
        let (scope, _guard) = Scope::background().child(Duration::ZERO);
        assert!(scope.deadline().is_none());
        assert!(scope.remaining().is_none());
        assert!(!scope.is_done());
    }
}
