//! Ready-made observers for a [`quern_core::WorkerPool`].
//!
//! - [`TracingObserver`] turns pool events into structured `tracing` records.
//! - [`OutcomeStats`] keeps lock-free counters and exposes a serializable [`StatsSnapshot`].
//! - [`init_tracing`] installs a `fmt` subscriber filtered by `RUST_LOG`.

mod log;
mod stats;

pub use log::TracingObserver;
pub use stats::{OutcomeStats, StatsSnapshot};

use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global `fmt` subscriber. Defaults to `info` when `RUST_LOG` is unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}
