//! Read-only snapshots of queue contents and workers for status reporting.
//! Best effort: every figure may be stale by one tick.

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::models::{HeartbeatRecord, Task, now_epoch};
use crate::store::{Keyspace, QueueStore};

pub const DEFAULT_SAMPLE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
  pub id: String,
  pub payload: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
  pub worker_id: String,
  pub status: String,
  pub current_task_id: Option<String>,
  pub last_heartbeat: f64,
  pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
  pub queue_size: usize,
  pub tasks: Vec<TaskSummary>,
  pub failed_tasks: Vec<TaskSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
  pub queue_size: usize,
  pub pending_count: usize,
  pub processing_count: usize,
  pub failed_count: usize,
  pub tasks: Vec<TaskSummary>,
  pub failed_tasks: Vec<TaskSummary>,
  pub workers: Vec<WorkerSummary>,
}

async fn sample(store: &dyn QueueStore, queue: &str, limit: usize, location: Option<&str>) -> StoreResult<Vec<TaskSummary>> {
  let items = store.range(queue, limit).await?;
  Ok(
    items
      .iter()
      .filter_map(|raw| serde_json::from_str::<Task>(raw).ok())
      .map(|task| TaskSummary {
        id: task.id,
        payload: task.payload,
        location: location.map(str::to_string),
      })
      .collect(),
  )
}

async fn processing_queues(store: &dyn QueueStore, keys: &Keyspace) -> StoreResult<Vec<String>> {
  store.list_keys(&keys.processing_prefix()).await
}

/// Samples of pending and in-flight tasks (tagged with their queue) plus failed tasks.
pub async fn queue_status(store: &dyn QueueStore, keys: &Keyspace, limit: usize) -> StoreResult<QueueStatus> {
  let pending = keys.pending();
  let mut tasks = sample(store, &pending, limit, Some(&pending)).await?;
  for queue in processing_queues(store, keys).await? {
    tasks.extend(sample(store, &queue, limit, Some(&queue)).await?);
  }
  let failed_tasks = sample(store, &keys.failed(), limit, None).await?;
  Ok(QueueStatus {
    queue_size: tasks.len(),
    tasks,
    failed_tasks,
  })
}

/// Queue counts, samples and every worker with a heartbeat record.
pub async fn system_status(
  store: &dyn QueueStore,
  keys: &Keyspace,
  limit: usize,
  heartbeat_timeout_secs: f64,
) -> StoreResult<SystemStatus> {
  let pending = keys.pending();
  let failed = keys.failed();
  let pending_count = store.length(&pending).await?;
  let failed_count = store.length(&failed).await?;
  let mut processing_count = 0;
  for queue in processing_queues(store, keys).await? {
    processing_count += store.length(&queue).await?;
  }

  let now = now_epoch();
  let mut workers = Vec::new();
  for key in store.list_keys(&keys.heartbeat_prefix()).await? {
    let Some(raw) = store.get(&key).await? else {
      continue;
    };
    let Ok(record) = serde_json::from_str::<HeartbeatRecord>(&raw) else {
      continue;
    };
    workers.push(WorkerSummary {
      alive: !record.is_expired(now, heartbeat_timeout_secs),
      status: record.status.as_str().to_string(),
      worker_id: record.worker_id,
      current_task_id: record.current_task_id,
      last_heartbeat: record.last_heartbeat,
    });
  }
  workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

  Ok(SystemStatus {
    queue_size: pending_count,
    pending_count,
    processing_count,
    failed_count,
    tasks: sample(store, &pending, limit, None).await?,
    failed_tasks: sample(store, &failed, limit, None).await?,
    workers,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use std::time::Duration;

  #[tokio::test]
  async fn queue_status_tags_locations_and_skips_garbage() {
    let store = MemoryStore::new();
    let keys = Keyspace::default();
    store.push(&keys.pending(), &Task::new("p1", "a").to_json().unwrap()).await.unwrap();
    store.push(&keys.pending(), "{broken").await.unwrap();
    store.push(&keys.processing("w1"), &Task::new("r1", "b").to_json().unwrap()).await.unwrap();
    store.push(&keys.failed(), &Task::new("f1", "c").to_json().unwrap()).await.unwrap();

    let status = queue_status(&store, &keys, DEFAULT_SAMPLE).await.unwrap();
    assert_eq!(status.queue_size, 2);
    assert_eq!(status.tasks[0].location.as_deref(), Some("pending"));
    assert_eq!(status.tasks[1].location.as_deref(), Some("processing:w1"));
    assert_eq!(status.failed_tasks[0].id, "f1");
  }

  #[tokio::test]
  async fn system_status_reports_counts_and_workers() {
    let store = MemoryStore::new();
    let keys = Keyspace::default();
    for i in 0..3 {
      store.push(&keys.pending(), &Task::new(format!("p{i}"), "x").to_json().unwrap()).await.unwrap();
    }
    let mut stale = HeartbeatRecord::new("old", "processing:old", None);
    stale.last_heartbeat -= 60.0;
    let fresh = HeartbeatRecord::new("new", "processing:new", Some("t1"));
    for record in [&stale, &fresh] {
      store
        .set(&keys.heartbeat(&record.worker_id), &serde_json::to_string(record).unwrap(), Duration::from_secs(60))
        .await
        .unwrap();
    }

    let status = system_status(&store, &keys, 2, 10.0).await.unwrap();
    assert_eq!(status.pending_count, 3);
    assert_eq!(status.tasks.len(), 2);
    assert_eq!(status.failed_count, 0);
    assert_eq!(status.workers.len(), 2);
    assert_eq!(status.workers[0].worker_id, "new");
    assert!(status.workers[0].alive);
    assert_eq!(status.workers[0].status, "processing");
    assert!(!status.workers[1].alive);
  }
}
