//! Worker process: heartbeats, then picks up, executes and acknowledges the
//! head of its own processing queue, one task at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::StoreResult;
use crate::models::{HeartbeatRecord, QueuedTask, WorkerStatus, now_epoch};
use crate::store::{Keyspace, QueueStore};
use crate::worker_processing::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub worker_id: String,
  pub heartbeat_interval: Duration,
  pub poll_interval: Duration,
  pub error_backoff: Duration,
}

impl WorkerSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      worker_id: config.worker_id.clone(),
      heartbeat_interval: config.heartbeat_interval,
      poll_interval: config.worker_poll,
      error_backoff: config.worker_backoff,
    }
  }

  /// Heartbeat records expire after twice the publishing interval, so a
  /// crashed worker's record disappears on its own.
  pub fn heartbeat_ttl(&self) -> Duration {
    self.heartbeat_interval * 2
  }
}

/// Outcome of a single pass of the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
  /// Processing queue was empty.
  Empty,
  Completed { task_id: String },
  Failed { task_id: String },
  /// Head entry could not be parsed and was discarded.
  Dropped,
}

pub struct Worker {
  store: Arc<dyn QueueStore>,
  keys: Keyspace,
  handlers: HandlerRegistry,
  settings: WorkerSettings,
  processing_queue: String,
  heartbeat_key: String,
  status: WorkerStatus,
  last_heartbeat: Option<Instant>,
}

impl Worker {
  pub fn new(store: Arc<dyn QueueStore>, keys: Keyspace, handlers: HandlerRegistry, settings: WorkerSettings) -> Self {
    let processing_queue = keys.processing(&settings.worker_id);
    let heartbeat_key = keys.heartbeat(&settings.worker_id);
    Self {
      store,
      keys,
      handlers,
      settings,
      processing_queue,
      heartbeat_key,
      status: WorkerStatus::Idle,
      last_heartbeat: None,
    }
  }

  pub fn worker_id(&self) -> &str {
    &self.settings.worker_id
  }

  pub fn processing_queue(&self) -> &str {
    &self.processing_queue
  }

  pub fn status(&self) -> WorkerStatus {
    self.status
  }

  /// Publish a liveness record. Failures are logged; the next tick retries.
  pub async fn update_heartbeat(&mut self, current_task_id: Option<&str>) {
    let record = HeartbeatRecord::new(&self.settings.worker_id, &self.processing_queue, current_task_id);
    let ttl = self.settings.heartbeat_ttl();
    let result = match serde_json::to_string(&record) {
      Ok(json) => self.store.set(&self.heartbeat_key, &json, ttl).await.map_err(|e| e.to_string()),
      Err(e) => Err(e.to_string()),
    };
    match result {
      Ok(()) => self.last_heartbeat = Some(Instant::now()),
      Err(e) => error!(worker_id = %self.settings.worker_id, error = %e, "Error updating heartbeat"),
    }
  }

  async fn heartbeat_if_due(&mut self) {
    let due = self
      .last_heartbeat
      .is_none_or(|at| at.elapsed() >= self.settings.heartbeat_interval);
    if due {
      self.update_heartbeat(None).await;
    }
  }

  /// One pass of the worker loop. Execution errors become failed-queue entries;
  /// only store errors while reading the queue are returned.
  pub async fn run_once(&mut self) -> StoreResult<Iteration> {
    let Some(raw) = self.store.peek(&self.processing_queue).await? else {
      return Ok(Iteration::Empty);
    };

    let mut queued = match QueuedTask::parse(raw.clone()) {
      Ok(queued) => queued,
      Err(e) => {
        warn!(worker_id = %self.settings.worker_id, error = %e, "Error decoding task JSON, dropping entry");
        if !self.store.remove_one(&self.processing_queue, &raw).await? {
          warn!(worker_id = %self.settings.worker_id, "Undecodable entry already gone from processing queue");
        }
        return Ok(Iteration::Dropped);
      }
    };

    let task_id = queued.task.id.clone();
    queued.task.processing_start_timestamp = Some(now_epoch());
    info!(worker_id = %self.settings.worker_id, task_id = %task_id, "Picked up task");
    self.status = WorkerStatus::Processing;
    self.update_heartbeat(Some(&task_id)).await;

    let outcome = match self.handlers.execute(&queued.task).await {
      Ok(result) => {
        info!(worker_id = %self.settings.worker_id, task_id = %task_id, result = %result, "Completed task");
        self.acknowledge(&queued).await;
        Iteration::Completed { task_id }
      }
      Err(e) => {
        error!(worker_id = %self.settings.worker_id, task_id = %task_id, error = %e, "Error processing task");
        self.fail(&queued).await;
        Iteration::Failed { task_id }
      }
    };

    self.status = WorkerStatus::Idle;
    self.update_heartbeat(None).await;
    Ok(outcome)
  }

  async fn acknowledge(&self, queued: &QueuedTask) {
    match self.store.remove_one(&self.processing_queue, queued.receipt.as_str()).await {
      Ok(true) => info!(worker_id = %self.settings.worker_id, task_id = %queued.task.id, "Confirmed completion"),
      Ok(false) => warn!(
        worker_id = %self.settings.worker_id,
        task_id = %queued.task.id,
        "Task not found in processing queue during removal; it may have been reclaimed"
      ),
      Err(e) => error!(worker_id = %self.settings.worker_id, task_id = %queued.task.id, error = %e, "Failed to remove completed task"),
    }
  }

  async fn fail(&self, queued: &QueuedTask) {
    let failed = self.keys.failed();
    if let Err(e) = self.store.push(&failed, queued.receipt.as_str()).await {
      error!(
        worker_id = %self.settings.worker_id,
        task_id = %queued.task.id,
        error = %e,
        "CRITICAL: failed to push task to failed queue; it remains in the processing queue"
      );
      return;
    }
    match self.store.remove_one(&self.processing_queue, queued.receipt.as_str()).await {
      Ok(true) => info!(worker_id = %self.settings.worker_id, task_id = %queued.task.id, queue = %failed, "Moved failed task"),
      Ok(false) => warn!(
        worker_id = %self.settings.worker_id,
        task_id = %queued.task.id,
        "Failed task not found in processing queue during move; it may have been reclaimed"
      ),
      Err(e) => error!(
        worker_id = %self.settings.worker_id,
        task_id = %queued.task.id,
        error = %e,
        "CRITICAL: task pushed to failed queue but not removed from processing queue"
      ),
    }
  }

  pub async fn run(&mut self) {
    let (_tx, rx) = watch::channel(false);
    self.run_until(rx).await;
  }

  /// Loop until `shutdown` turns true, then withdraw the heartbeat record.
  pub async fn run_until(&mut self, mut shutdown: watch::Receiver<bool>) {
    info!(worker_id = %self.settings.worker_id, queue = %self.processing_queue, "Worker started, awaiting tasks");
    while !*shutdown.borrow() {
      self.heartbeat_if_due().await;
      let pause = match self.run_once().await {
        Ok(Iteration::Empty) => Some(self.settings.poll_interval),
        Ok(_) => None,
        Err(e) => {
          error!(worker_id = %self.settings.worker_id, error = %e, "Unhandled error in worker loop");
          Some(self.settings.error_backoff)
        }
      };
      if let Some(pause) = pause {
        tokio::select! {
          _ = sleep(pause) => {}
          changed = shutdown.changed() => {
            if changed.is_err() {
              sleep(pause).await;
            }
          }
        }
      }
    }
    if let Err(e) = self.store.delete(&self.heartbeat_key).await {
      warn!(worker_id = %self.settings.worker_id, error = %e, "Failed to remove heartbeat on shutdown");
    }
    info!(worker_id = %self.settings.worker_id, "Worker stopped");
  }
}
