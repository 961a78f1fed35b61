//! Worker loop behaviour: acknowledgement, failure routing, heartbeats and shutdown.


use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use test_harness::{Harness, handlers, task_json};
use taskmesh::models::{HeartbeatRecord, Task, WorkerStatus};
use taskmesh::store::QueueStore;
use taskmesh::worker_processing::{HandlerRegistry, TaskHandler};
use taskmesh::worker_runtime::Iteration;
use tokio::sync::{Notify, watch};

/// Signals when a task starts and holds it until released.
struct Gate {
  started: Arc<Notify>,
  release: Arc<Notify>,
}

#[async_trait]
impl TaskHandler for Gate {
  async fn execute(&self, task: &Task) -> Result<String> {
    self.started.notify_one();
    self.release.notified().await;
    Ok(format!("released {}", task.id))
  }
}

async fn heartbeat_of(h: &Harness, worker_id: &str) -> Option<HeartbeatRecord> {
  let raw = h.store.get(&h.keys.heartbeat(worker_id)).await.unwrap()?;
  Some(serde_json::from_str(&raw).unwrap())
}

#[tokio::test]
async fn empty_queue_is_a_no_op() {
  let h = Harness::new();
  let mut worker = h.worker("w1", handlers());

  assert_eq!(worker.run_once().await.unwrap(), Iteration::Empty);
  assert_eq!(worker.status(), WorkerStatus::Idle);
}

#[tokio::test]
async fn successful_task_is_removed_and_worker_returns_idle() {
  let h = Harness::new();
  let mut worker = h.worker("w1", handlers());
  h.store.push(worker.processing_queue(), &task_json("t1")).await.unwrap();

  let outcome = worker.run_once().await.unwrap();

  assert_eq!(outcome, Iteration::Completed { task_id: "t1".into() });
  assert_eq!(h.len(worker.processing_queue()).await, 0);
  assert_eq!(h.len(&h.keys.failed()).await, 0);
  assert_eq!(worker.status(), WorkerStatus::Idle);
  let record = heartbeat_of(&h, "w1").await.expect("heartbeat written");
  assert_eq!(record.status, WorkerStatus::Idle);
  assert_eq!(record.current_task_id, None);
  assert_eq!(record.processing_queue, worker.processing_queue());
}

#[tokio::test]
async fn failing_task_moves_to_failed_queue_verbatim() {
  let h = Harness::new();
  let mut worker = h.worker("w1", handlers());
  let raw = Task::new("t2", "doomed").with_kind("explode").to_json().unwrap();
  h.store.push(worker.processing_queue(), &raw).await.unwrap();

  let outcome = worker.run_once().await.unwrap();

  assert_eq!(outcome, Iteration::Failed { task_id: "t2".into() });
  assert_eq!(h.len(worker.processing_queue()).await, 0);
  assert_eq!(h.memory.snapshot(&h.keys.failed()).await, vec![raw]);
}

#[tokio::test]
async fn failed_tasks_append_at_the_tail() {
  let h = Harness::new();
  let mut worker = h.worker("w1", handlers());
  for id in ["f1", "f2"] {
    let raw = Task::new(id, "doomed").with_kind("explode").to_json().unwrap();
    h.store.push(worker.processing_queue(), &raw).await.unwrap();
  }

  worker.run_once().await.unwrap();
  worker.run_once().await.unwrap();

  assert_eq!(h.ids(&h.keys.failed()).await, vec!["f1", "f2"]);
}

#[tokio::test]
async fn unknown_kind_without_fallback_fails_the_task() {
  let h = Harness::new();
  let mut worker = h.worker("w1", HandlerRegistry::new());
  h.store.push(worker.processing_queue(), &task_json("t3")).await.unwrap();

  assert_eq!(worker.run_once().await.unwrap(), Iteration::Failed { task_id: "t3".into() });
  assert_eq!(h.ids(&h.keys.failed()).await, vec!["t3"]);
}

#[tokio::test]
async fn poison_entry_is_dropped_and_next_task_still_runs() {
  let h = Harness::new();
  let mut worker = h.worker("w1", handlers());
  h.store.push(worker.processing_queue(), "{not a task").await.unwrap();
  h.store.push(worker.processing_queue(), &task_json("t4")).await.unwrap();

  assert_eq!(worker.run_once().await.unwrap(), Iteration::Dropped);
  assert_eq!(h.len(&h.keys.failed()).await, 0);
  assert_eq!(h.len(&h.keys.pending()).await, 0);
  assert_eq!(h.ids(worker.processing_queue()).await, vec!["t4"]);

  assert_eq!(worker.run_once().await.unwrap(), Iteration::Completed { task_id: "t4".into() });
  assert_eq!(h.len(worker.processing_queue()).await, 0);
}

#[tokio::test]
async fn heartbeat_reports_current_task_while_processing() {
  let h = Harness::new();
  let started = Arc::new(Notify::new());
  let release = Arc::new(Notify::new());
  let gate = HandlerRegistry::with_default(Gate {
    started: started.clone(),
    release: release.clone(),
  });
  let mut worker = h.worker("w1", gate);
  h.store.push(worker.processing_queue(), &task_json("t5")).await.unwrap();

  let running = tokio::spawn(async move {
    let outcome = worker.run_once().await;
    (worker, outcome)
  });
  started.notified().await;

  let record = heartbeat_of(&h, "w1").await.expect("heartbeat written");
  assert_eq!(record.status, WorkerStatus::Processing);
  assert_eq!(record.current_task_id.as_deref(), Some("t5"));

  release.notify_one();
  let (worker, outcome) = running.await.unwrap();
  assert_eq!(outcome.unwrap(), Iteration::Completed { task_id: "t5".into() });
  assert_eq!(worker.status(), WorkerStatus::Idle);
  assert_eq!(heartbeat_of(&h, "w1").await.unwrap().status, WorkerStatus::Idle);
}

#[tokio::test]
async fn reclaimed_task_mid_execution_does_not_break_the_worker() {
  let h = Harness::new();
  let started = Arc::new(Notify::new());
  let release = Arc::new(Notify::new());
  let mut registry = handlers();
  registry.register(
    "slow",
    Gate {
      started: started.clone(),
      release: release.clone(),
    },
  );
  let mut worker = h.worker("w1", registry);
  let queue = worker.processing_queue().to_string();
  let raw = Task::new("t6", "slow work").with_kind("slow").to_json().unwrap();
  h.store.push(&queue, &raw).await.unwrap();

  let running = tokio::spawn(async move {
    let outcome = worker.run_once().await;
    (worker, outcome)
  });
  started.notified().await;

  // Reclaimed from under the worker, as the monitor would after a missed heartbeat.
  h.store.transfer(&queue, &h.keys.pending(), Duration::ZERO).await.unwrap();
  release.notify_one();

  let (mut worker, outcome) = running.await.unwrap();
  assert_eq!(outcome.unwrap(), Iteration::Completed { task_id: "t6".into() });
  assert_eq!(h.memory.snapshot(&h.keys.pending()).await, vec![raw]);
  assert_eq!(h.len(&queue).await, 0);
  assert_eq!(worker.run_once().await.unwrap(), Iteration::Empty);
}

#[tokio::test]
async fn store_outage_surfaces_from_run_once() {
  let h = Harness::new();
  let mut worker = h.worker("w1", handlers());
  h.memory.set_offline(true).await;

  assert!(worker.run_once().await.is_err());
}

#[tokio::test]
async fn run_until_processes_queue_and_withdraws_heartbeat() {
  let h = Harness::new();
  let worker = h.worker("w1", handlers());
  let queue = worker.processing_queue().to_string();
  for id in ["a", "b", "c"] {
    h.store.push(&queue, &task_json(id)).await.unwrap();
  }
  let (tx, rx) = watch::channel(false);

  let running = tokio::spawn(async move {
    let mut worker = worker;
    worker.run_until(rx).await;
  });

  let drained = tokio::time::timeout(Duration::from_secs(5), async {
    while h.len(&queue).await > 0 {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await;
  assert!(drained.is_ok(), "worker did not drain its queue");
  assert!(heartbeat_of(&h, "w1").await.is_some());

  tx.send(true).unwrap();
  tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();

  assert!(heartbeat_of(&h, "w1").await.is_none());
  assert_eq!(h.len(&h.keys.failed()).await, 0);
}
