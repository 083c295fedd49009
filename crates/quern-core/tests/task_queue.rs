use std::time::Duration;

use quern_core::{QueueError, Task, TaskQueue};
use tokio::time::timeout;

fn task(id: &str) -> Task {
    Task::new(id, |_| async { Ok(Vec::new()) })
}

#[tokio::test]
async fn fifo_enqueue_dequeue() {
    let queue = TaskQueue::new(10);

    queue.try_enqueue(task("t1")).unwrap();
    queue.try_enqueue(task("t2")).unwrap();
    assert_eq!(queue.len(), 2);

    let r1 = queue.dequeue().await.unwrap();
    let r2 = queue.dequeue().await.unwrap();

    assert_eq!(r1.id().as_str(), "t1");
    assert_eq!(r2.id().as_str(), "t2");
    assert!(queue.is_empty());
}

#[tokio::test]
async fn full_queue_rejects_immediately() {
    let queue = TaskQueue::new(1);
    queue.try_enqueue(task("first")).unwrap();

    assert_eq!(queue.try_enqueue(task("second")), Err(QueueError::Full));
    assert_eq!(queue.len(), 1);

    queue.dequeue().await.unwrap();
    queue.try_enqueue(task("third")).unwrap();
}

#[tokio::test(start_paused = true)]
async fn dequeue_waits_for_work() {
    let queue = TaskQueue::new(5);

    assert!(timeout(Duration::from_millis(50), queue.dequeue()).await.is_err());

    queue.try_enqueue(task("late")).unwrap();
    let out = queue.dequeue().await.unwrap();
    assert_eq!(out.id().as_str(), "late");
}

#[tokio::test]
async fn close_stops_intake_but_keeps_backlog() {
    let queue = TaskQueue::new(5);
    queue.try_enqueue(task("a")).unwrap();
    queue.try_enqueue(task("b")).unwrap();

    queue.close();
    queue.close();
    assert!(queue.is_closed());
    assert_eq!(queue.try_enqueue(task("c")), Err(QueueError::Closed));

    assert_eq!(queue.dequeue().await.unwrap().id().as_str(), "a");
    assert_eq!(queue.dequeue().await.unwrap().id().as_str(), "b");
    assert!(queue.dequeue().await.is_none());
}

#[tokio::test]
async fn drain_remaining_empties_without_waiting() {
    let queue = TaskQueue::new(5);
    for id in ["x", "y", "z"] {
        queue.try_enqueue(task(id)).unwrap();
    }

    let left: Vec<String> = queue
        .drain_remaining()
        .await
        .iter()
        .map(|t| t.id().to_string())
        .collect();

    assert_eq!(left, vec!["x", "y", "z"]);
    assert_eq!(queue.len(), 0);
    assert!(queue.drain_remaining().await.is_empty());
}
