use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::StoreResult;
use crate::models::{HeartbeatRecord, now_epoch};
use crate::store::{Keyspace, QueueStore};

/// Tasks handed back to the pending queue after a worker was declared dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclamation {
  pub worker_id: String,
  pub processing_queue: String,
  pub requeued: usize,
}

/// Watches heartbeat records and returns the in-flight work of dead workers to `pending`.
pub struct HeartbeatMonitor {
  store: Arc<dyn QueueStore>,
  keys: Keyspace,
  timeout: Duration,
}

impl HeartbeatMonitor {
  pub fn new(store: Arc<dyn QueueStore>, keys: Keyspace, timeout: Duration) -> Self {
    Self { store, keys, timeout }
  }

  /// One monitor tick. A bad record is logged and skipped; only a failure to
  /// enumerate keys is returned.
  pub async fn check_heartbeats(&self) -> StoreResult<Vec<Reclamation>> {
    let mut reclaimed = Vec::new();
    for key in self.store.list_keys(&self.keys.heartbeat_prefix()).await? {
      match self.check_one(&key).await {
        Ok(Some(reclamation)) => reclaimed.push(reclamation),
        Ok(None) => {}
        Err(e) => warn!(key = %key, error = %e, "Error processing heartbeat"),
      }
    }
    match self.sweep_orphans().await {
      Ok(orphans) => reclaimed.extend(orphans),
      Err(e) => warn!(error = %e, "Error sweeping orphaned processing queues"),
    }
    Ok(reclaimed)
  }

  async fn check_one(&self, key: &str) -> anyhow::Result<Option<Reclamation>> {
    let Some(raw) = self.store.get(key).await? else {
      return Ok(None);
    };
    let record: HeartbeatRecord = serde_json::from_str(&raw)?;
    if !record.is_complete() {
      anyhow::bail!("heartbeat record is missing worker_id or processing_queue");
    }
    if !record.is_expired(now_epoch(), self.timeout.as_secs_f64()) {
      return Ok(None);
    }

    warn!(worker_id = %record.worker_id, last_heartbeat = record.last_heartbeat, "Worker is inactive, reassigning tasks");
    let requeued = self.requeue_tasks(&record.processing_queue).await?;
    self.store.delete(key).await?;
    Ok(Some(Reclamation {
      worker_id: record.worker_id,
      processing_queue: record.processing_queue,
      requeued,
    }))
  }

  /// Processing queues still holding tasks after their heartbeat key expired
  /// outright (TTL elapsed before the timeout check saw the record).
  async fn sweep_orphans(&self) -> StoreResult<Vec<Reclamation>> {
    let mut reclaimed = Vec::new();
    for queue in self.store.list_keys(&self.keys.processing_prefix()).await? {
      let Some(worker_id) = self.keys.worker_of_processing(&queue) else {
        continue;
      };
      if self.store.get(&self.keys.heartbeat(worker_id)).await?.is_some() {
        continue;
      }
      warn!(worker_id, queue = %queue, "Processing queue has no heartbeat, reassigning tasks");
      let requeued = self.requeue_tasks(&queue).await?;
      if requeued > 0 {
        reclaimed.push(Reclamation {
          worker_id: worker_id.to_string(),
          processing_queue: queue.clone(),
          requeued,
        });
      }
    }
    Ok(reclaimed)
  }

  /// Move every task in `processing_queue` to the tail of `pending`, oldest first.
  /// Each move is atomic, so an interruption leaves every task in exactly one queue.
  async fn requeue_tasks(&self, processing_queue: &str) -> StoreResult<usize> {
    let pending = self.keys.pending();
    let mut requeued = 0;
    while let Some(task_json) = self.store.transfer(processing_queue, &pending, Duration::ZERO).await? {
      requeued += 1;
      info!(
        task_id = %crate::worker_scheduler::task_id_of(&task_json),
        from = %processing_queue,
        to = %pending,
        "Requeued task"
      );
    }
    Ok(requeued)
  }

  pub async fn run(&self, interval: Duration) {
    info!(timeout_secs = self.timeout.as_secs_f64(), "Started monitoring for dead workers");
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      if let Err(e) = self.check_heartbeats().await {
        error!(error = %e, "Error listing heartbeat records");
      }
    }
  }
}
