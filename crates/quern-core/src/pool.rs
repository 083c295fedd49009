//! Fixed-size worker pool over one bounded queue.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinSet, time::Instant};
use tracing::{debug, info};

use crate::{
    TaskId,
    breaker::{BreakerConfig, CircuitBreaker},
    config::{PoolConfig, Settings},
    error::{ConfigError, ShutdownError, SubmitError},
    events::{Event, EventKind, Hooks, Observer, OutcomeCallback},
    queue::{QueueError, TaskQueue},
    retry::{RetryExecutor, RetryPolicy},
    scope::{Scope, ScopeGuard},
    shutdown::ShutdownCoordinator,
    state::PoolState,
    task::{Task, TaskOutcome, TaskStatus},
    worker::worker_loop,
};

/// State shared by the pool handle, its workers and the shutdown coordinator.
pub(crate) struct Shared {
    pub(crate) config: PoolConfig,
    pub(crate) queue: TaskQueue,
    pub(crate) state: watch::Sender<PoolState>,
    pub(crate) root: Scope,
    pub(crate) root_guard: ScopeGuard,
    pub(crate) retry: RetryExecutor,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) in_flight: AtomicUsize,
    live: Mutex<HashSet<TaskId>>,
    shutdown_result: OnceLock<Result<(), ShutdownError>>,
}

impl Shared {
    /// Reports a terminal outcome and forgets the task id.
    pub(crate) fn report(&self, worker: Option<usize>, outcome: TaskOutcome) {
        self.live_ids().remove(&outcome.task_id);

        let kind = match outcome.status {
            TaskStatus::Succeeded => EventKind::TaskSucceeded,
            TaskStatus::FailedPermanent | TaskStatus::FailedRetriesExhausted => {
                EventKind::TaskFailed
            }
            TaskStatus::Dropped => EventKind::TaskDropped,
        };

        let mut event = Event::now(kind)
            .with_task(&outcome.task_id)
            .with_attempt(outcome.attempts);
        if let Some(worker) = worker {
            event = event.with_worker(worker);
        }
        if let Some(err) = &outcome.last_error {
            event = event.with_error(err.to_string());
        }
        self.hooks.emit(event.with_outcome(outcome));
    }

    /// Stores the shutdown result, then publishes `Stopped`.
    pub(crate) fn finish(&self, result: Result<(), ShutdownError>) {
        let _ = self.shutdown_result.set(result);

        let stopped = self.state.send_if_modified(|state| match state.mark_as_stopped() {
            Ok(next) => {
                *state = next;
                true
            }
            Err(_) => false,
        });

        if stopped {
            info!("worker pool stopped");
            self.hooks.emit(Event::now(EventKind::PoolStopped));
        }
    }

    fn live_ids(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for [`WorkerPool`].
pub struct WorkerPoolBuilder {
    config: PoolConfig,
    retry: RetryPolicy,
    breaker: BreakerConfig,
    observers: Vec<Arc<dyn Observer>>,
}

impl WorkerPoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Applies pool, retry and breaker settings in one go.
    pub fn settings(self, settings: Settings) -> Result<Self, ConfigError> {
        let retry = settings.retry.into_policy()?;
        Ok(self
            .config(settings.pool)
            .retry_policy(retry)
            .breaker(settings.breaker))
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn on_outcome<F>(self, callback: F) -> Self
    where
        F: Fn(&TaskOutcome) + Send + Sync + 'static,
    {
        self.observer(Arc::new(OutcomeCallback(callback)))
    }

    /// Validates the configuration and spawns the workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<WorkerPool, ConfigError> {
        self.config.validate()?;

        let hooks = Arc::new(Hooks::default());
        for observer in self.observers {
            hooks.subscribe(observer);
        }

        let listener_hooks = Arc::clone(&hooks);
        let breaker = CircuitBreaker::new(self.breaker)?.with_listener(move |transition| {
            listener_hooks
                .emit(Event::now(EventKind::BreakerStateChanged).with_transition(transition));
        });

        let (root, root_guard) = Scope::background().child(Duration::ZERO);
        let (state, _) = watch::channel(PoolState::Running);

        let shared = Arc::new(Shared {
            queue: TaskQueue::new(self.config.queue_capacity),
            state,
            root,
            root_guard,
            retry: RetryExecutor::new(self.retry),
            breaker: Arc::new(breaker),
            hooks,
            in_flight: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
            shutdown_result: OnceLock::new(),
            config: self.config,
        });

        let mut workers = JoinSet::new();
        for id in 0..shared.config.workers {
            workers.spawn(worker_loop(id, Arc::clone(&shared)));
        }

        info!(
            workers = shared.config.workers,
            capacity = shared.config.queue_capacity,
            "worker pool started"
        );

        Ok(WorkerPool {
            shared,
            workers: Mutex::new(Some(workers)),
        })
    }
}

/// Bounded worker pool with retries, a shared circuit breaker and graceful shutdown.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use quern_core::{PoolConfig, Task, WorkerPool};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = WorkerPool::builder()
///     .config(PoolConfig { workers: 2, queue_capacity: 16, ..PoolConfig::default() })
///     .on_outcome(|outcome| println!("{} -> {}", outcome.task_id, outcome.status))
///     .build()?;
///
/// pool.submit(Task::new("hello", |_ctx| async { Ok(b"world".to_vec()) }))?;
/// pool.shutdown(Duration::from_secs(1)).await?;
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("state", &self.state())
            .field("workers", &self.workers())
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl WorkerPool {
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            config: PoolConfig::default(),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            observers: Vec::new(),
        }
    }

    /// Hands `task` to the pool without waiting.
    pub fn submit(&self, mut task: Task) -> Result<(), SubmitError> {
        let id = task.id().clone();
        let result = self.enqueue(&mut task);

        match &result {
            Ok(()) => {
                debug!(task_id = %id, priority = task.priority(), "task accepted");
                self.shared
                    .hooks
                    .emit(Event::now(EventKind::TaskEnqueued).with_task(&id));
            }
            Err(err) => {
                debug!(task_id = %id, reason = err.as_label(), "task rejected");
                self.shared.hooks.emit(
                    Event::now(EventKind::TaskRejected)
                        .with_task(&id)
                        .with_error(err.to_string()),
                );
            }
        }

        result
    }

    fn enqueue(&self, task: &mut Task) -> Result<(), SubmitError> {
        if !self.shared.state.borrow().is_accepting() {
            return Err(SubmitError::PoolClosed);
        }

        let id = task.id().clone();
        if !self.shared.live_ids().insert(id.clone()) {
            return Err(SubmitError::DuplicateTaskId(id));
        }

        task.mark_enqueued(Instant::now());
        self.shared.queue.try_enqueue(task.clone()).map_err(|err| {
            self.shared.live_ids().remove(&id);
            match err {
                QueueError::Full => SubmitError::QueueFull {
                    capacity: self.shared.queue.capacity(),
                },
                QueueError::Closed => SubmitError::PoolClosed,
            }
        })
    }

    /// Registers a callback for every terminal [`TaskOutcome`].
    pub fn on_outcome<F>(&self, callback: F)
    where
        F: Fn(&TaskOutcome) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(OutcomeCallback(callback)));
    }

    /// Registers an observer for all pool events.
    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.shared.hooks.subscribe(observer);
    }

    /// Stops intake and starts the shutdown countdown in the background.
    ///
    /// Returns `false` if shutdown was already initiated.
    pub fn initiate_shutdown(&self, grace: Duration) -> bool {
        let started = self.shared.state.send_if_modified(|state| match state.mark_as_draining() {
            Ok(next) => {
                *state = next;
                true
            }
            Err(_) => false,
        });
        if !started {
            return false;
        }

        self.shared.queue.close();
        info!(
            grace_ms = grace.as_millis() as u64,
            queued = self.queued(),
            in_flight = self.in_flight(),
            "shutdown requested; draining"
        );
        self.shared
            .hooks
            .emit(Event::now(EventKind::ShutdownRequested).with_delay(grace));

        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        let coordinator = ShutdownCoordinator::new(Arc::clone(&self.shared), workers);
        tokio::spawn(coordinator.run(grace));

        true
    }

    /// Drains the pool and waits until it is stopped.
    ///
    /// Returns [`ShutdownError::Forced`] if in-flight work had to be
    /// force-cancelled after `grace`. A second call waits for the first
    /// shutdown and returns its result; its own `grace` is ignored.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ShutdownError> {
        self.initiate_shutdown(grace);
        self.stopped().await
    }

    /// Waits until the pool reaches `Stopped` without initiating shutdown.
    pub async fn stopped(&self) -> Result<(), ShutdownError> {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(PoolState::is_terminal).await;
        self.shared
            .shutdown_result
            .get()
            .cloned()
            .unwrap_or(Ok(()))
    }

    pub fn state(&self) -> PoolState {
        *self.shared.state.borrow()
    }

    /// Tasks accepted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Tasks dequeued whose outcome has not been reported yet.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    pub fn workers(&self) -> usize {
        self.shared.config.workers
    }

    /// The breaker shared by every worker of this pool.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.state().is_accepting() {
            debug!("worker pool dropped while running; cancelling");
            self.shared.queue.close();
            self.shared.root_guard.cancel();
        }
    }
}
