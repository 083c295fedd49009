use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use quern_core::{
    Event, EventKind, Observer, PoolConfig, PoolState, ShutdownError, SubmitError, Task, TaskError,
    TaskOutcome, TaskStatus, WorkerPool,
};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    fn outcomes(&self) -> Vec<TaskOutcome> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.outcome.as_deref().cloned())
            .collect()
    }
}

impl Observer for Recorder {
    fn on_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

fn pool(workers: usize, recorder: &Arc<Recorder>) -> WorkerPool {
    WorkerPool::builder()
        .config(PoolConfig {
            workers,
            queue_capacity: 16,
            force_window: Duration::from_millis(200),
            ..PoolConfig::default()
        })
        .observer(recorder.clone())
        .build()
        .unwrap()
}

fn sleeper(id: &str, dur: Duration) -> Task {
    Task::new(id, move |_| async move {
        tokio::time::sleep(dur).await;
        Ok(Vec::new())
    })
}

#[tokio::test(start_paused = true)]
async fn graceful_drain_completes_all_tasks() {
    let recorder = Arc::new(Recorder::default());
    let pool = pool(2, &recorder);

    for i in 0..5 {
        pool.submit(sleeper(&format!("short-{i}"), Duration::from_millis(40)))
            .unwrap();
    }

    pool.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(pool.state(), PoolState::Stopped);

    let outcomes = recorder.outcomes();
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|o| o.status == TaskStatus::Succeeded));

    let kinds = recorder.kinds();
    assert!(kinds.contains(&EventKind::ShutdownRequested));
    assert!(kinds.contains(&EventKind::DrainCompleted));
    assert!(!kinds.contains(&EventKind::ForceCancelled));
    assert_eq!(kinds.last(), Some(&EventKind::PoolStopped));
}

#[tokio::test(start_paused = true)]
async fn grace_exceeded_forces_cancellation() {
    let recorder = Arc::new(Recorder::default());
    let pool = pool(1, &recorder);

    // Ignores its scope entirely.
    pool.submit(sleeper("stubborn", Duration::from_secs(10)))
        .unwrap();
    pool.submit(sleeper("queued", Duration::from_millis(1)))
        .unwrap();

    let err = pool.shutdown(Duration::from_millis(100)).await.unwrap_err();
    let ShutdownError::Forced { grace, unfinished } = err.clone();
    assert_eq!(grace, Duration::from_millis(100));
    assert_eq!(unfinished, 2);
    assert_eq!(err.as_label(), "shutdown_forced");

    let outcomes = recorder.outcomes();
    assert_eq!(outcomes.len(), 2);

    let stubborn = outcomes.iter().find(|o| o.task_id.as_str() == "stubborn").unwrap();
    assert_eq!(stubborn.status, TaskStatus::FailedPermanent);
    assert_eq!(stubborn.last_error, Some(TaskError::Canceled));

    let queued = outcomes.iter().find(|o| o.task_id.as_str() == "queued").unwrap();
    assert_eq!(queued.status, TaskStatus::Dropped);
    assert_eq!(queued.attempts, 0);

    let kinds = recorder.kinds();
    assert!(kinds.contains(&EventKind::ForceCancelled));
    assert!(!kinds.contains(&EventKind::DrainCompleted));
    assert_eq!(kinds.last(), Some(&EventKind::PoolStopped));
}

#[tokio::test(start_paused = true)]
async fn repeated_shutdown_returns_first_result() {
    let recorder = Arc::new(Recorder::default());
    let pool = pool(1, &recorder);

    pool.submit(sleeper("long", Duration::from_secs(30))).unwrap();

    let first = pool.shutdown(Duration::from_millis(10)).await;
    assert!(!pool.initiate_shutdown(Duration::from_secs(60)));
    let second = pool.shutdown(Duration::from_secs(60)).await;

    assert!(first.is_err());
    assert_eq!(first, second);

    let stopped = recorder
        .kinds()
        .into_iter()
        .filter(|k| *k == EventKind::PoolStopped)
        .count();
    assert_eq!(stopped, 1);
}

#[tokio::test(start_paused = true)]
async fn draining_pool_rejects_new_work_but_finishes_queue() {
    let recorder = Arc::new(Recorder::default());
    let pool = pool(1, &recorder);

    pool.submit(sleeper("a", Duration::from_millis(20))).unwrap();
    pool.submit(sleeper("b", Duration::from_millis(20))).unwrap();

    assert!(pool.initiate_shutdown(Duration::from_secs(1)));
    assert_eq!(pool.state(), PoolState::Draining);
    assert_eq!(
        pool.submit(sleeper("c", Duration::ZERO)).unwrap_err(),
        SubmitError::PoolClosed
    );

    pool.stopped().await.unwrap();

    let mut done: Vec<String> = recorder
        .outcomes()
        .iter()
        .map(|o| o.task_id.to_string())
        .collect();
    done.sort();
    assert_eq!(done, vec!["a".to_string(), "b".to_string()]);

    let rejected = recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind == EventKind::TaskRejected)
        .count();
    assert_eq!(rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn cooperative_task_sees_forced_cancellation() {
    let recorder = Arc::new(Recorder::default());
    let pool = pool(1, &recorder);

    pool.submit(Task::new("polite", |ctx| async move {
        ctx.scope.done().await;
        Err(ctx
            .scope
            .err()
            .map(TaskError::from)
            .unwrap_or(TaskError::Canceled))
    }))
    .unwrap();

    let err = pool.shutdown(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, ShutdownError::Forced { unfinished: 1, .. }));

    let outcome = recorder.outcomes().pop().unwrap();
    assert_eq!(outcome.status, TaskStatus::FailedPermanent);
    assert!(outcome.last_error.unwrap().is_cancellation());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_shutdown_does_not_wait_for_blocked_thread() {
    let recorder = Arc::new(Recorder::default());
    let pool = WorkerPool::builder()
        .config(PoolConfig {
            workers: 1,
            queue_capacity: 4,
            force_window: Duration::from_millis(100),
            ..PoolConfig::default()
        })
        .observer(recorder.clone())
        .build()
        .unwrap();

    pool.submit(Task::new("hog", |_| async {
        std::thread::sleep(Duration::from_secs(2));
        tokio::task::yield_now().await;
        Ok(Vec::new())
    }))
    .unwrap();
    while pool.in_flight() < 1 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let started = std::time::Instant::now();
    let res = pool.shutdown(Duration::from_millis(100)).await;
    let took = started.elapsed();

    assert_eq!(
        res,
        Err(ShutdownError::Forced {
            grace: Duration::from_millis(100),
            unfinished: 1
        })
    );
    assert!(took < Duration::from_secs(1), "shutdown took {took:?}");
    assert_eq!(pool.state(), PoolState::Stopped);

    // The hog is reported once its thread comes back.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while recorder.outcomes().is_empty() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let outcomes = recorder.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, TaskStatus::FailedPermanent);
    assert_eq!(outcomes[0].last_error, Some(TaskError::Canceled));
}
