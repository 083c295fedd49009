//! Retry with exponential backoff and jitter.
//!
//! The delay after failed attempt `n` is `min(base_delay * 2^(n-1), max_delay)`,
//! spread by `jitter` and clipped back to `[0, max_delay]`. Cancellation errors
//! and panics are never retried.

use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;
use rand::Rng;
use tracing::debug;

use crate::{
    error::{ConfigError, TaskError, panic_message},
    scope::Scope,
};

type Classifier = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

/// Retry configuration. Immutable once built; share it behind an `Arc`.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    classifier: Classifier,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 100ms base, 10s cap, 20% jitter, [`TaskError::is_retryable`].
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
            classifier: Arc::new(TaskError::is_retryable),
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: RetryPolicy::default(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn is_retryable(&self, err: &TaskError) -> bool {
        if err.is_cancellation() || matches!(err, TaskError::Panicked { .. }) {
            return false;
        }
        (self.classifier)(err)
    }

    /// Un-jittered delay after failed attempt `attempt` (1-indexed).
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Jittered delay after failed attempt `attempt`, clipped to `[0, max_delay]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let spread = rand::rng().random_range(0.0..2.0 * self.jitter);
        let secs = base.as_secs_f64() * (1.0 - self.jitter + spread);
        Duration::try_from_secs_f64(secs.clamp(0.0, self.max_delay.as_secs_f64()))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Validating builder for [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.policy.max_attempts = n;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Fraction of the delay to randomise, in `[0, 1)`.
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.policy.jitter = fraction;
        self
    }

    /// Replaces the default "is this retryable" classifier.
    pub fn retry_if<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&TaskError) -> bool + Send + Sync + 'static,
    {
        self.policy.classifier = Arc::new(classifier);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        let p = self.policy;
        if p.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if p.base_delay.is_zero() {
            return Err(ConfigError::invalid("base_delay", "must be greater than zero"));
        }
        if p.max_delay < p.base_delay {
            return Err(ConfigError::invalid(
                "max_delay",
                format!("{:?} is below base_delay {:?}", p.max_delay, p.base_delay),
            ));
        }
        if !(0.0..1.0).contains(&p.jitter) {
            return Err(ConfigError::invalid(
                "jitter",
                format!("{} is outside [0, 1)", p.jitter),
            ));
        }
        Ok(p)
    }
}

/// Result of [`RetryExecutor::run`].
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, TaskError>,
    /// Operation invocations; for metrics, not control flow.
    pub attempts: u32,
}

/// A retry about to be scheduled, reported before the backoff sleep.
#[derive(Debug)]
pub struct RetryNotice<'a> {
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a TaskError,
}

/// Runs fallible operations under a shared [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: Arc<RetryPolicy>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `scope` is done. `op` receives the 1-indexed attempt number.
    pub async fn run<T, F, Fut>(&self, scope: &Scope, op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        self.run_observed(scope, op, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `notify` before every backoff sleep.
    pub async fn run_observed<T, F, Fut, N>(&self, scope: &Scope, mut op: F, mut notify: N) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
        N: FnMut(RetryNotice<'_>),
    {
        let mut attempt = 0;
        loop {
            if let Some(err) = scope.err() {
                return Attempted {
                    result: Err(err.into()),
                    attempts: attempt,
                };
            }

            attempt += 1;
            // `op` itself may panic before handing back a future.
            let call = AssertUnwindSafe(async { op(attempt).await }).catch_unwind();
            let result = tokio::select! {
                res = call => res.unwrap_or_else(|panic| Err(TaskError::Panicked {
                    message: panic_message(&*panic),
                })),
                _ = scope.done() => Err(scope_error(scope)),
            };

            let err = match result {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) => err,
            };

            if attempt >= self.policy.max_attempts || !self.policy.is_retryable(&err) {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            let mut delay = self.policy.backoff(attempt);
            if let TaskError::BreakerOpen { retry_after } = &err {
                delay = delay.max(*retry_after).min(self.policy.max_delay);
            }
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "scheduling retry");
            notify(RetryNotice {
                attempt,
                delay,
                error: &err,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scope.done() => {
                    return Attempted {
                        result: Err(scope_error(scope)),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

fn scope_error(scope: &Scope) -> TaskError {
    scope.err().map(TaskError::from).unwrap_or(TaskError::Canceled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .jitter(0.0)
            .build()
            .unwrap()
    }

    #[test]
    fn rejects_invalid_policies() {
        assert!(RetryPolicy::builder().base_delay(Duration::ZERO).build().is_err());
        assert!(RetryPolicy::builder().max_attempts(0).build().is_err());
        assert!(RetryPolicy::builder().jitter(1.0).build().is_err());
        assert!(RetryPolicy::builder().jitter(-0.1).build().is_err());
        assert!(
            RetryPolicy::builder()
                .base_delay(Duration::from_secs(2))
                .max_delay(Duration::from_secs(1))
                .build()
                .is_err()
        );
    }

    #[test]
    fn exponential_growth_is_capped() {
        let p = policy(10);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(5), Duration::from_secs(1));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_band_and_cap() {
        let p = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(300))
            .jitter(0.5)
            .build()
            .unwrap();

        for _ in 0..200 {
            let first = p.backoff(1);
            assert!(first >= Duration::from_millis(50), "{first:?}");
            assert!(first < Duration::from_millis(150), "{first:?}");

            let capped = p.backoff(4);
            assert!(capped <= Duration::from_millis(300), "{capped:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_runs_exactly_max_attempts() {
        let exec = RetryExecutor::new(policy(4));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let out: Attempted<()> = exec
            .run(&Scope::background(), move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::transient("down"))
            })
            .await;

        assert_eq!(out.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(out.result.unwrap_err(), TaskError::transient("down"));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let exec = RetryExecutor::new(policy(5));
        let out: Attempted<()> = exec
            .run(&Scope::background(), |_| async { Err(TaskError::permanent("bad input")) })
            .await;

        assert_eq!(out.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let exec = RetryExecutor::new(policy(5));
        let mut delays = Vec::new();

        let out = exec
            .run_observed(
                &Scope::background(),
                |attempt| async move {
                    if attempt < 3 {
                        Err(TaskError::transient("flaky"))
                    } else {
                        Ok(attempt)
                    }
                },
                |notice| delays.push(notice.delay),
            )
            .await;

        assert_eq!(out.result.unwrap(), 3);
        assert_eq!(out.attempts, 3);
        assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleep_is_interrupted_by_scope() {
        let exec = RetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(3)
                .base_delay(Duration::from_secs(60))
                .max_delay(Duration::from_secs(60))
                .jitter(0.0)
                .build()
                .unwrap(),
        );
        let (scope, _guard) = Scope::background().child(Duration::from_millis(10));
        let started = tokio::time::Instant::now();

        let out: Attempted<()> = exec
            .run(&scope, |_| async { Err(TaskError::transient("down")) })
            .await;

        assert_eq!(out.result.unwrap_err(), TaskError::DeadlineExceeded);
        assert_eq!(out.attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn panic_becomes_non_retryable_error() {
        let exec = RetryExecutor::new(policy(3));
        let out: Attempted<()> = exec
            .run(&Scope::background(), |_| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await;

        assert_eq!(out.attempts, 1);
        assert_eq!(
            out.result.unwrap_err(),
            TaskError::Panicked {
                message: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn panic_before_future_is_caught() {
        let exec = RetryExecutor::new(policy(3));
        let out: Attempted<()> = exec
            .run(&Scope::background(), |_| -> std::future::Ready<Result<(), TaskError>> {
                panic!("eager boom")
            })
            .await;

        assert_eq!(out.attempts, 1);
        assert_eq!(
            out.result.unwrap_err(),
            TaskError::Panicked {
                message: "eager boom".into()
            }
        );
    }

    #[test]
    fn huge_max_delay_does_not_overflow() {
        let p = RetryPolicy::builder()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::MAX)
            .jitter(0.5)
            .build()
            .unwrap();

        assert_eq!(p.base_backoff(200), Duration::MAX);
        assert!(p.backoff(200) <= Duration::MAX);
        assert!(p.backoff(64) > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_hint_raises_delay_floor() {
        let exec = RetryExecutor::new(policy(2));
        let mut delays = Vec::new();

        let _: Attempted<()> = exec
            .run_observed(
                &Scope::background(),
                |_| async {
                    Err(TaskError::BreakerOpen {
                        retry_after: Duration::from_millis(700),
                    })
                },
                |notice| delays.push(notice.delay),
            )
            .await;

        assert_eq!(delays, vec![Duration::from_millis(700)]);
    }

    #[tokio::test]
    async fn custom_classifier_is_consulted() {
        let exec = RetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(3)
                .retry_if(|_| false)
                .build()
                .unwrap(),
        );
        let out: Attempted<()> = exec
            .run(&Scope::background(), |_| async { Err(TaskError::transient("x")) })
            .await;

        assert_eq!(out.attempts, 1);
    }

    #[tokio::test]
    async fn cancelled_scope_runs_nothing() {
        let (scope, guard) = Scope::background().child(Duration::ZERO);
        guard.cancel();

        let out: Attempted<()> = RetryExecutor::new(policy(3))
            .run(&scope, |_| async { Ok(()) })
            .await;

        assert_eq!(out.attempts, 0);
        assert_eq!(out.result.unwrap_err(), TaskError::Canceled);
    }
}
