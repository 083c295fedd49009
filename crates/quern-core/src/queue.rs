use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info};

use crate::task::Task;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is closed")]
    Closed,
}

/// Bounded FIFO shared by the producers and all workers.
///
/// Enqueue never blocks: a full queue is reported immediately. After
/// [`close`](TaskQueue::close), consumers still receive everything that was
/// accepted before, then `None`.
#[derive(Debug)]
pub struct TaskQueue {
    ready_tx: Mutex<Option<mpsc::Sender<Task>>>,
    ready_rx: AsyncMutex<mpsc::Receiver<Task>>,

    len: AtomicUsize,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        info!(capacity, "initializing task queue");

        let (ready_tx, ready_rx) = mpsc::channel(capacity);

        Self {
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx: AsyncMutex::new(ready_rx),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn try_enqueue(&self, task: Task) -> Result<(), QueueError> {
        let guard = self.ready_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(QueueError::Closed);
        };

        // Counted before the send so a fast consumer never sees len underflow.
        self.len.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(task) {
            Ok(()) => {
                debug!(queued = self.len(), "task enqueued");
                Ok(())
            }
            Err(err) => {
                self.len.fetch_sub(1, Ordering::SeqCst);
                match err {
                    mpsc::error::TrySendError::Full(_) => Err(QueueError::Full),
                    mpsc::error::TrySendError::Closed(_) => Err(QueueError::Closed),
                }
            }
        }
    }

    /// Next task in FIFO order, or `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<Task> {
        let mut rx = self.ready_rx.lock().await;
        let task = rx.recv().await;

        if task.is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }

        task
    }

    /// Stops intake. Idempotent.
    pub fn close(&self) {
        let tx = self
            .ready_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if tx.is_some() {
            info!(remaining = self.len(), "task queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ready_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Removes whatever is still buffered without waiting.
    pub async fn drain_remaining(&self) -> Vec<Task> {
        let mut rx = self.ready_rx.lock().await;
        let mut out = Vec::new();

        while let Ok(task) = rx.try_recv() {
            self.len.fetch_sub(1, Ordering::SeqCst);
            out.push(task);
        }

        if !out.is_empty() {
            debug!(count = out.len(), "drained leftover tasks");
        }

        out
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
