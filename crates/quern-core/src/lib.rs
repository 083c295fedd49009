//! In-process task engine: a bounded queue feeding a fixed pool of workers.
//! Each task runs in its own [`Scope`], through a [`RetryExecutor`] and a
//! shared [`CircuitBreaker`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use quern_core::{PoolConfig, Task, TaskError, WorkerPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = WorkerPool::builder()
//!         .config(PoolConfig { workers: 4, queue_capacity: 64, ..PoolConfig::default() })
//!         .on_outcome(|o| println!("{} finished: {} after {} attempt(s)", o.task_id, o.status, o.attempts))
//!         .build()?;
//!
//!     pool.submit(Task::new("fetch-1", |ctx| async move {
//!         if ctx.attempt < 2 {
//!             return Err(TaskError::transient("upstream timed out"));
//!         }
//!         Ok(b"ok".to_vec())
//!     }))?;
//!
//!     pool.shutdown(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

mod breaker;
mod config;
mod error;
mod events;
mod ids;
mod pool;
mod queue;
mod retry;
mod scope;
mod shutdown;
mod state;
mod task;
mod worker;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, BreakerTransition, CircuitBreaker};
pub use config::{PoolConfig, RetrySettings, Settings};
pub use error::{ConfigError, ScopeError, ShutdownError, SubmitError, TaskError};
pub use events::{Event, EventKind, Hooks, Observer};
pub use ids::TaskId;
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use queue::{QueueError, TaskQueue};
pub use retry::{Attempted, RetryExecutor, RetryNotice, RetryPolicy, RetryPolicyBuilder};
pub use scope::{Scope, ScopeGuard, new_scope};
pub use shutdown::wait_for_shutdown_signal;
pub use state::{PoolState, StateTransitionError};
pub use task::{Payload, Task, TaskContext, TaskFuture, TaskOutcome, TaskOutput, TaskStatus};
