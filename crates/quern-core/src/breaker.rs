//! Circuit breaker over a time-bucketed sliding window.
//!
//! Closed trips to Open once `min_requests` calls are in the window and the
//! failure ratio reaches `failure_ratio`. After `cooldown` a single probe is
//! admitted in HalfOpen: success closes the breaker, failure reopens it.
//! Cancellations are not counted. A panicking call counts as a failure.

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    error::{ConfigError, TaskError},
    scope::Scope,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds.
///
/// Defaults: 10 requests, 50% failures, 5s cooldown, 10s window in 10 buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Minimum requests in the window before the ratio is considered.
    pub min_requests: u64,
    /// Failure ratio in `(0, 1]` that trips the breaker.
    pub failure_ratio: f64,
    /// How long the breaker stays open before admitting a probe.
    pub cooldown: Duration,
    /// Length of the sliding window.
    pub window: Duration,
    /// Number of buckets the window is split into.
    pub buckets: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 10,
            failure_ratio: 0.5,
            cooldown: Duration::from_secs(5),
            window: Duration::from_secs(10),
            buckets: 10,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_requests == 0 {
            return Err(ConfigError::invalid("min_requests", "must be at least 1"));
        }
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "failure_ratio",
                format!("{} is outside (0, 1]", self.failure_ratio),
            ));
        }
        if self.cooldown.is_zero() {
            return Err(ConfigError::invalid("cooldown", "must be greater than zero"));
        }
        if self.buckets == 0 {
            return Err(ConfigError::invalid("buckets", "must be at least 1"));
        }
        if (self.window / self.buckets).is_zero() {
            return Err(ConfigError::invalid(
                "window",
                format!("{:?} is too short for {} buckets", self.window, self.buckets),
            ));
        }
        Ok(())
    }

    fn bucket_width(&self) -> Duration {
        self.window / self.buckets
    }
}

/// A state change, reported to the transition listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub successes: u64,
    pub failures: u64,
    pub failure_ratio: f64,
}

type Listener = Arc<dyn Fn(BreakerTransition) + Send + Sync>;

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    listener: Option<Listener>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    window: Window,
    opened_at: Option<Instant>,
    probing: bool,
}

impl Inner {
    fn set_state(&mut self, to: BreakerState) -> Option<BreakerTransition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(BreakerTransition { from, to })
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let window = Window::new(config.window, config.bucket_width());
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window,
                opened_at: None,
                probing: false,
            }),
            listener: None,
        })
    }

    /// Registers a callback invoked after every state change, outside the lock.
    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(BreakerTransition) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Stored state. An `Open` breaker whose cooldown has elapsed stays `Open`
    /// here until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        let state = inner.state;
        let (successes, failures) = inner.window.totals(Instant::now());
        let total = successes + failures;
        BreakerSnapshot {
            state,
            successes,
            failures,
            failure_ratio: if total == 0 {
                0.0
            } else {
                failures as f64 / total as f64
            },
        }
    }

    /// Runs `op` if the breaker admits it; otherwise fails fast with
    /// [`TaskError::BreakerOpen`]. Never waits.
    pub async fn execute<T, F, Fut>(&self, scope: &Scope, op: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        if let Some(err) = scope.err() {
            return Err(err.into());
        }
        let permit = self.admit()?;
        let result = match AssertUnwindSafe(async { op().await }).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                permit.settle(Some(false));
                std::panic::resume_unwind(panic);
            }
        };
        permit.settle(match &result {
            Ok(_) => Some(true),
            Err(e) if e.counts_against_breaker() => Some(false),
            Err(_) => None,
        });
        result
    }

    fn admit(&self) -> Result<Permit<'_>, TaskError> {
        let now = Instant::now();
        let mut transition = None;
        let admitted = {
            let mut inner = self.lock();
            match inner.state {
                BreakerState::Closed => Ok(false),
                BreakerState::Open => {
                    let reopen = inner
                        .opened_at
                        .unwrap_or(now)
                        .checked_add(self.config.cooldown);
                    match reopen {
                        Some(at) if now >= at => {
                            transition = inner.set_state(BreakerState::HalfOpen);
                            inner.probing = true;
                            Ok(true)
                        }
                        Some(at) => Err(TaskError::BreakerOpen {
                            retry_after: at - now,
                        }),
                        None => Err(TaskError::BreakerOpen {
                            retry_after: self.config.cooldown,
                        }),
                    }
                }
                BreakerState::HalfOpen if inner.probing => Err(TaskError::BreakerOpen {
                    retry_after: self.config.cooldown,
                }),
                BreakerState::HalfOpen => {
                    inner.probing = true;
                    Ok(true)
                }
            }
        };
        self.announce(transition);

        admitted.map(|probe| Permit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// `outcome`: `Some(true)` success, `Some(false)` failure, `None` not counted.
    fn settle(&self, probe: bool, outcome: Option<bool>) {
        let now = Instant::now();
        let mut transition = None;
        {
            let mut inner = self.lock();
            if probe {
                inner.probing = false;
                match outcome {
                    Some(true) => {
                        transition = inner.set_state(BreakerState::Closed);
                        inner.opened_at = None;
                        inner.window.reset();
                    }
                    Some(false) => {
                        transition = inner.set_state(BreakerState::Open);
                        inner.opened_at = Some(now);
                    }
                    None => {}
                }
            } else if inner.state == BreakerState::Closed {
                if let Some(success) = outcome {
                    inner.window.record(now, success);
                    let (successes, failures) = inner.window.totals(now);
                    let total = successes + failures;
                    if total >= self.config.min_requests
                        && failures as f64 / total as f64 >= self.config.failure_ratio
                    {
                        transition = inner.set_state(BreakerState::Open);
                        inner.opened_at = Some(now);
                        inner.window.reset();
                    }
                }
            }
        }
        self.announce(transition);
    }

    fn announce(&self, transition: Option<BreakerTransition>) {
        let Some(t) = transition else {
            return;
        };
        match t.to {
            BreakerState::Open => warn!(from = %t.from, "circuit breaker opened"),
            BreakerState::HalfOpen => info!("circuit breaker half-open; admitting probe"),
            BreakerState::Closed => info!(from = %t.from, "circuit breaker closed"),
        }
        if let Some(listener) = &self.listener {
            listener(t);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission ticket. A permit dropped before settling (its call was
/// cancelled) frees the probe slot without changing state.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: Option<bool>) {
        self.settled = true;
        self.breaker.settle(self.probe, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.settle(true, None);
        }
    }
}

#[derive(Debug)]
struct Bucket {
    start: Instant,
    successes: u64,
    failures: u64,
}

/// Time-bucketed counts; buckets older than `span` expire.
#[derive(Debug)]
struct Window {
    span: Duration,
    width: Duration,
    buckets: VecDeque<Bucket>,
}

impl Window {
    fn new(span: Duration, width: Duration) -> Self {
        Self {
            span,
            width,
            buckets: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if front.start.checked_add(self.span).is_some_and(|end| end <= now) {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, success: bool) {
        self.expire(now);
        let fresh = match self.buckets.back() {
            Some(last) => last.start.checked_add(self.width).is_some_and(|end| now >= end),
            None => true,
        };
        if fresh {
            self.buckets.push_back(Bucket {
                start: now,
                successes: 0,
                failures: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if success {
                bucket.successes += 1;
            } else {
                bucket.failures += 1;
            }
        }
    }

    fn totals(&mut self, now: Instant) -> (u64, u64) {
        self.expire(now);
        self.buckets
            .iter()
            .fold((0, 0), |(s, f), b| (s + b.successes, f + b.failures))
    }

    fn reset(&mut self) {
        self.buckets.clear();
    }
}
