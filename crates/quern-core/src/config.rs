//! Typed pool configuration.
//!
//! Everything can be built in code; [`Settings::from_env`] layers `QUERN_*`
//! environment variables over the defaults and fails fast on malformed values.
//!
//! | Variable                      | Field                        |
//! |-------------------------------|------------------------------|
//! | `QUERN_WORKERS`               | `pool.workers`               |
//! | `QUERN_QUEUE_CAPACITY`        | `pool.queue_capacity`        |
//! | `QUERN_TASK_TIMEOUT_MS`       | `pool.task_timeout` (0 = none) |
//! | `QUERN_FORCE_WINDOW_MS`       | `pool.force_window`          |
//! | `QUERN_RETRY_MAX_ATTEMPTS`    | `retry.max_attempts`         |
//! | `QUERN_RETRY_BASE_MS`         | `retry.base_delay`           |
//! | `QUERN_RETRY_MAX_MS`          | `retry.max_delay`            |
//! | `QUERN_RETRY_JITTER`          | `retry.jitter`               |
//! | `QUERN_BREAKER_MIN_REQUESTS`  | `breaker.min_requests`       |
//! | `QUERN_BREAKER_FAILURE_RATIO` | `breaker.failure_ratio`      |
//! | `QUERN_BREAKER_COOLDOWN_MS`   | `breaker.cooldown`           |
//! | `QUERN_BREAKER_WINDOW_MS`     | `breaker.window`             |

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{breaker::BreakerConfig, error::ConfigError, retry::RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent workers (N).
    pub workers: usize,
    /// Maximum number of queued, not yet started tasks (C).
    pub queue_capacity: usize,
    /// Default per-task timeout. `Duration::ZERO` means no timeout.
    pub task_timeout: Duration,
    /// After the grace period runs out and the root scope is cancelled, how
    /// long to wait for workers to notice before abandoning them.
    pub force_window: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 128,
            task_timeout: Duration::ZERO,
            force_window: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
        }
        Ok(())
    }

    /// `None` when no default timeout is configured.
    pub fn default_timeout(&self) -> Option<Duration> {
        (!self.task_timeout.is_zero()).then_some(self.task_timeout)
    }
}

/// Serializable mirror of [`RetryPolicy`] without the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts(),
            base_delay: policy.base_delay(),
            max_delay: policy.max_delay(),
            jitter: policy.jitter(),
        }
    }
}

impl RetrySettings {
    /// Builds a policy with the default retry classifier.
    pub fn into_policy(self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .base_delay(self.base_delay)
            .max_delay(self.max_delay)
            .jitter(self.jitter)
            .build()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub pool: PoolConfig,
    pub retry: RetrySettings,
    pub breaker: BreakerConfig,
}

impl Settings {
    /// Defaults overridden by `QUERN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut s = Settings::default();

        override_with(&lookup, "QUERN_WORKERS", &mut s.pool.workers)?;
        override_with(&lookup, "QUERN_QUEUE_CAPACITY", &mut s.pool.queue_capacity)?;
        override_millis(&lookup, "QUERN_TASK_TIMEOUT_MS", &mut s.pool.task_timeout)?;
        override_millis(&lookup, "QUERN_FORCE_WINDOW_MS", &mut s.pool.force_window)?;

        override_with(&lookup, "QUERN_RETRY_MAX_ATTEMPTS", &mut s.retry.max_attempts)?;
        override_millis(&lookup, "QUERN_RETRY_BASE_MS", &mut s.retry.base_delay)?;
        override_millis(&lookup, "QUERN_RETRY_MAX_MS", &mut s.retry.max_delay)?;
        override_with(&lookup, "QUERN_RETRY_JITTER", &mut s.retry.jitter)?;

        override_with(&lookup, "QUERN_BREAKER_MIN_REQUESTS", &mut s.breaker.min_requests)?;
        override_with(&lookup, "QUERN_BREAKER_FAILURE_RATIO", &mut s.breaker.failure_ratio)?;
        override_millis(&lookup, "QUERN_BREAKER_COOLDOWN_MS", &mut s.breaker.cooldown)?;
        override_millis(&lookup, "QUERN_BREAKER_WINDOW_MS", &mut s.breaker.window)?;

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.retry.clone().into_policy()?;
        self.breaker.validate()
    }
}

fn override_with<L, T>(lookup: &L, var: &str, slot: &mut T) -> Result<(), ConfigError>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(var) else {
        return Ok(());
    };

    *slot = raw.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: raw.clone(),
    })?;
    Ok(())
}

fn override_millis<L>(lookup: &L, var: &str, slot: &mut Duration) -> Result<(), ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    let mut ms = slot.as_millis() as u64;
    override_with(lookup, var, &mut ms)?;
    *slot = Duration::from_millis(ms);
    Ok(())
}
