use std::{sync::Arc, time::Duration};

use quern_core::{Settings, SubmitError, Task, TaskError, WorkerPool, wait_for_shutdown_signal};
use quern_observability::{OutcomeStats, TracingObserver, init_tracing};
use rand::Rng;
use tokio::time::sleep;
use tracing::{error, info, warn};

const GRACE: Duration = Duration::from_secs(5);
const DEMO_TASKS: usize = 200;

/// Simulated downstream call: slow sometimes, failing sometimes.
async fn call_dependency(payload: Arc<[u8]>) -> Result<Vec<u8>, TaskError> {
    let (latency_ms, roll) = {
        let mut rng = rand::rng();
        (rng.random_range(5..60), rng.random_range(0..100))
    };
    sleep(Duration::from_millis(latency_ms)).await;

    match roll {
        0..=14 => Err(TaskError::transient("dependency timed out")),
        15..=17 => Err(TaskError::permanent("dependency rejected payload")),
        _ => Ok(payload.iter().rev().copied().collect()),
    }
}

/// Submits the demo workload, backing off while the queue is full.
async fn produce(pool: &WorkerPool) {
    for i in 0..DEMO_TASKS {
        let task = Task::new(format!("job-{i}"), |ctx| call_dependency(ctx.payload))
            .with_payload(format!("payload-{i}").into_bytes());

        loop {
            match pool.submit(task.clone()) {
                Ok(()) => break,
                Err(SubmitError::QueueFull { .. }) => sleep(Duration::from_millis(20)).await,
                Err(err) => {
                    warn!(%err, "producer stopping");
                    return;
                }
            }
        }
    }
    info!("producer finished");
}

#[tokio::main]
async fn main() {
    init_tracing();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(2);
        }
    };
    info!(
        workers = settings.pool.workers,
        capacity = settings.pool.queue_capacity,
        "starting worker demo"
    );

    let stats = Arc::new(OutcomeStats::new());
    let pool = match WorkerPool::builder()
        .settings(settings)
        .map(|b| b.observer(Arc::new(TracingObserver)).observer(stats.clone()))
        .and_then(|b| b.build())
    {
        Ok(pool) => pool,
        Err(err) => {
            error!(%err, "failed to build worker pool");
            std::process::exit(2);
        }
    };

    tokio::select! {
        _ = produce(&pool) => {}
        res = wait_for_shutdown_signal() => {
            if let Err(err) = res {
                error!(%err, "failed to listen for shutdown signal");
            }
        }
    }

    match pool.shutdown(GRACE).await {
        Ok(()) => info!("pool drained cleanly"),
        Err(err) => warn!(%err, label = err.as_label(), "pool shutdown was forced"),
    }

    let snapshot = stats.snapshot();
    info!(
        enqueued = snapshot.enqueued,
        rejected = snapshot.rejected,
        retries = snapshot.retries,
        succeeded = snapshot.succeeded,
        failed_permanent = snapshot.failed_permanent,
        retries_exhausted = snapshot.retries_exhausted,
        dropped = snapshot.dropped,
        breaker_trips = snapshot.breaker_trips,
        "final stats"
    );
}
