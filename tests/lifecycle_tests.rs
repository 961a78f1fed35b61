//! Whole-cluster runs: scheduler, monitor and several workers sharing one store.
//! Every submitted task must be executed at least once, including work that was
//! in flight on a worker that died.


use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use test_harness::Harness;
use taskmesh::heartbeat_monitor::HeartbeatMonitor;
use taskmesh::models::Task;
use taskmesh::store::QueueStore;
use taskmesh::worker_processing::{HandlerRegistry, TaskHandler};
use taskmesh::worker_runtime::{Worker, WorkerSettings};
use taskmesh::worker_scheduler::{Assignment, Scheduler, SlotPolicy};
use tokio::sync::{Notify, watch};

const HEARTBEAT: Duration = Duration::from_millis(100);
const TIMEOUT: Duration = Duration::from_millis(500);
const TICK: Duration = Duration::from_millis(50);

#[derive(Clone, Default)]
struct Recorder {
  seen: Arc<Mutex<HashSet<String>>>,
}

impl Recorder {
  fn seen(&self) -> HashSet<String> {
    self.seen.lock().unwrap().clone()
  }
}

#[async_trait]
impl TaskHandler for Recorder {
  async fn execute(&self, task: &Task) -> Result<String> {
    tokio::time::sleep(Duration::from_millis(5)).await;
    self.seen.lock().unwrap().insert(task.id.clone());
    Ok(task.payload.clone())
  }
}

/// Never finishes; used to pin a task on a worker that is then killed.
struct Hang(Arc<Notify>);

#[async_trait]
impl TaskHandler for Hang {
  async fn execute(&self, _task: &Task) -> Result<String> {
    self.0.notify_one();
    std::future::pending().await
  }
}

fn worker(h: &Harness, worker_id: &str, handlers: HandlerRegistry) -> Worker {
  let settings = WorkerSettings {
    worker_id: worker_id.to_string(),
    heartbeat_interval: HEARTBEAT,
    poll_interval: Duration::from_millis(10),
    error_backoff: Duration::from_millis(50),
  };
  Worker::new(h.store.clone(), h.keys.clone(), handlers, settings)
}

/// Count each task id across `pending`, `failed` and every processing queue in one
/// consistent snapshot.
async fn placements(h: &Harness) -> HashMap<String, usize> {
  let processing = h.keys.processing_prefix();
  let mut counts = HashMap::new();
  for (queue, items) in h.memory.snapshot_all().await {
    if queue != h.keys.pending() && queue != h.keys.failed() && !queue.starts_with(&processing) {
      continue;
    }
    for raw in items {
      let id = serde_json::from_str::<Task>(&raw).map(|t| t.id).unwrap_or(raw);
      *counts.entry(id).or_insert(0) += 1;
    }
  }
  counts
}

/// While the cluster runs, every accepted task that has not executed yet must sit
/// in exactly one queue. Returns the number of snapshots checked.
async fn watch_placements(
  h: Harness,
  accepted: Arc<Mutex<HashSet<String>>>,
  recorder: Recorder,
  mut stop: watch::Receiver<bool>,
) -> usize {
  let mut samples = 0;
  while !*stop.borrow() {
    // Accepted is read before the snapshot and seen after it, so a task counted
    // as outstanding was placed before and not yet run at snapshot time.
    let outstanding = accepted.lock().unwrap().clone();
    let counts = placements(&h).await;
    let seen = recorder.seen();
    for id in outstanding.difference(&seen) {
      let copies = counts.get(id).copied().unwrap_or(0);
      assert_eq!(copies, 1, "task {id} held {copies} times in snapshot {samples}: {counts:?}");
    }
    samples += 1;
    tokio::select! {
      _ = tokio::time::sleep(Duration::from_millis(3)) => {}
      _ = stop.changed() => {}
    }
  }
  samples
}

async fn run_cluster(policy: SlotPolicy) {
  let h = Harness::new();
  let recorder = Recorder::default();

  // A worker that picks up one task and dies mid-execution without cleanup.
  let hung = Arc::new(Notify::new());
  let mut doomed = worker(&h, "doomed", HandlerRegistry::with_default(Hang(hung.clone())));
  let stuck = Task::new("stuck", "in flight when the worker died").to_json().unwrap();
  h.store.push(doomed.processing_queue(), &stuck).await.unwrap();
  let doomed = tokio::spawn(async move { doomed.run().await });
  hung.notified().await;
  doomed.abort();

  let scheduler = Arc::new(Scheduler::new(h.store.clone(), h.keys.clone(), policy, TIMEOUT));
  let monitor = Arc::new(HeartbeatMonitor::new(h.store.clone(), h.keys.clone(), TIMEOUT));
  let mut background = vec![
    tokio::spawn({
      let scheduler = scheduler.clone();
      async move { scheduler.run_dispatch_loop(TICK).await }
    }),
    tokio::spawn({
      let monitor = monitor.clone();
      async move { monitor.run(TICK).await }
    }),
  ];

  let (shutdown, rx) = watch::channel(false);
  let mut workers = Vec::new();
  for id in ["w1", "w2", "w3"] {
    let mut w = worker(&h, id, HandlerRegistry::with_default(recorder.clone()));
    let rx = rx.clone();
    workers.push(tokio::spawn(async move { w.run_until(rx).await }));
  }

  let accepted = Arc::new(Mutex::new(HashSet::from(["stuck".to_string()])));
  let (stop_watching, watching) = watch::channel(false);
  let watcher = tokio::spawn(watch_placements(h.clone(), accepted.clone(), recorder.clone(), watching));

  let mut expected: HashSet<String> = HashSet::from(["stuck".to_string()]);
  for i in 0..30 {
    let id = format!("T{i:03}");
    let outcome = scheduler.assign(Task::new(id.clone(), format!("Random number: {i}"))).await;
    assert_ne!(outcome, Assignment::Lost);
    accepted.lock().unwrap().insert(id.clone());
    expected.insert(id);
    if i % 5 == 0 {
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  }

  let finished = tokio::time::timeout(Duration::from_secs(15), async {
    while !recorder.seen().is_superset(&expected) {
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  })
  .await;
  let missing: Vec<_> = expected.difference(&recorder.seen()).cloned().collect();
  assert!(finished.is_ok(), "policy {policy:?} never ran {missing:?}");

  stop_watching.send(true).unwrap();
  let samples = tokio::time::timeout(Duration::from_secs(5), watcher).await.unwrap().unwrap();
  assert!(samples > 0, "placements were never checked");

  shutdown.send(true).unwrap();
  for handle in workers {
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
  }
  for handle in background.drain(..) {
    handle.abort();
  }

  assert_eq!(h.len(&h.keys.failed()).await, 0);
  assert_eq!(h.len(&h.keys.pending()).await, 0);
  assert!(h.store.get(&h.keys.heartbeat("doomed")).await.unwrap().is_none());
  assert!(h.store.list_keys(&h.keys.processing_prefix()).await.unwrap().is_empty());
  assert!(h.store.list_keys(&h.keys.heartbeat_prefix()).await.unwrap().is_empty());
}

#[tokio::test]
async fn single_slot_cluster_runs_every_task() {
  run_cluster(SlotPolicy::SingleSlot).await;
}

#[tokio::test]
async fn stacking_cluster_runs_every_task() {
  run_cluster(SlotPolicy::Stack).await;
}
