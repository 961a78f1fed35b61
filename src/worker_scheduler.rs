use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::StoreResult;
use crate::models::{HeartbeatRecord, Task, now_epoch};
use crate::store::{Keyspace, QueueStore};

/// How direct assignment and dispatch share a worker's processing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPolicy {
  /// A worker queue is only ever filled while empty, through conditional store operations.
  SingleSlot,
  /// Append to the least-loaded worker regardless of its current depth.
  Stack,
}

#[derive(Debug, Error)]
#[error("unknown slot policy '{0}', expected 'single' or 'stack'")]
pub struct ParseSlotPolicyError(String);

impl FromStr for SlotPolicy {
  type Err = ParseSlotPolicyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "single" | "single_slot" | "single-slot" => Ok(SlotPolicy::SingleSlot),
      "stack" => Ok(SlotPolicy::Stack),
      other => Err(ParseSlotPolicyError(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLoad {
  pub worker_id: String,
  pub processing_queue: String,
  pub load: usize,
}

/// Where `assign` left a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
  Worker(String),
  Pending,
  /// The store rejected the write; the task is in no queue.
  Lost,
}

pub struct Scheduler {
  store: Arc<dyn QueueStore>,
  keys: Keyspace,
  policy: SlotPolicy,
  heartbeat_timeout: Duration,
}

impl Scheduler {
  pub fn new(store: Arc<dyn QueueStore>, keys: Keyspace, policy: SlotPolicy, heartbeat_timeout: Duration) -> Self {
    Self {
      store,
      keys,
      policy,
      heartbeat_timeout,
    }
  }

  /// Live workers and the depth of their processing queues. Unparsable,
  /// incomplete or timed-out heartbeat records are skipped.
  pub async fn live_workers(&self) -> StoreResult<Vec<WorkerLoad>> {
    let now = now_epoch();
    let timeout = self.heartbeat_timeout.as_secs_f64();
    let mut workers = Vec::new();
    for key in self.store.list_keys(&self.keys.heartbeat_prefix()).await? {
      let Some(raw) = self.store.get(&key).await? else {
        continue;
      };
      let record = match serde_json::from_str::<HeartbeatRecord>(&raw) {
        Ok(record) if record.is_complete() => record,
        Ok(_) => {
          debug!(key = %key, "Skipping incomplete heartbeat record");
          continue;
        }
        Err(e) => {
          warn!(key = %key, error = %e, "Skipping unparsable heartbeat record");
          continue;
        }
      };
      if record.is_expired(now, timeout) {
        continue;
      }
      let load = self.store.length(&record.processing_queue).await?;
      workers.push(WorkerLoad {
        worker_id: record.worker_id,
        processing_queue: record.processing_queue,
        load,
      });
    }
    Ok(workers)
  }

  /// The least-loaded live worker; ties are broken uniformly at random.
  pub async fn select_worker(&self) -> StoreResult<Option<WorkerLoad>> {
    let workers = self.live_workers().await?;
    Ok(least_loaded(workers))
  }

  /// Place a new task on an idle worker or, failing that, on the pending queue.
  /// Store failures are logged and reported as `Assignment::Lost`, never raised.
  pub async fn assign(&self, mut task: Task) -> Assignment {
    task.ensure_submitted();
    let task_json = match task.to_json() {
      Ok(json) => json,
      Err(e) => {
        error!(task_id = %task.id, error = %e, "Failed to serialize task");
        return Assignment::Lost;
      }
    };

    let selected = match self.select_worker().await {
      Ok(selected) => selected,
      Err(e) => {
        error!(task_id = %task.id, error = %e, "Error fetching worker statuses");
        None
      }
    };

    if let Some(worker) = selected {
      match self.place_on_worker(&worker, &task_json).await {
        Ok(true) => {
          info!(task_id = %task.id, worker_id = %worker.worker_id, "Task assigned to worker");
          return Assignment::Worker(worker.worker_id);
        }
        Ok(false) => {
          debug!(task_id = %task.id, worker_id = %worker.worker_id, "Worker slot taken, queueing task");
        }
        Err(e) => {
          error!(task_id = %task.id, worker_id = %worker.worker_id, error = %e, "Failed to assign task to worker");
          return Assignment::Lost;
        }
      }
    }

    let pending = self.keys.pending();
    match self.store.push(&pending, &task_json).await {
      Ok(()) => {
        info!(task_id = %task.id, queue = %pending, "No available worker, task queued");
        Assignment::Pending
      }
      Err(e) => {
        error!(task_id = %task.id, queue = %pending, error = %e, "Failed to queue task");
        Assignment::Lost
      }
    }
  }

  async fn place_on_worker(&self, worker: &WorkerLoad, task_json: &str) -> StoreResult<bool> {
    match self.policy {
      SlotPolicy::Stack => {
        self.store.push(&worker.processing_queue, task_json).await?;
        Ok(true)
      }
      SlotPolicy::SingleSlot if worker.load == 0 => {
        self.store.push_if_empty(&worker.processing_queue, task_json).await
      }
      SlotPolicy::SingleSlot => Ok(false),
    }
  }

  /// One dispatch cycle: hand one pending task to every idle live worker.
  /// Returns the number of tasks moved.
  pub async fn dispatch_once(&self) -> StoreResult<usize> {
    let pending = self.keys.pending();
    if self.store.length(&pending).await? == 0 {
      return Ok(0);
    }

    let idle = self.live_workers().await?.into_iter().filter(|w| w.load == 0);
    let mut moved = 0;
    for worker in idle {
      let result = match self.policy {
        SlotPolicy::SingleSlot => self.store.transfer_if_empty(&pending, &worker.processing_queue).await,
        SlotPolicy::Stack => {
          self
            .store
            .transfer(&pending, &worker.processing_queue, Duration::ZERO)
            .await
        }
      };
      match result {
        Ok(Some(task_json)) => {
          moved += 1;
          info!(task_id = %task_id_of(&task_json), worker_id = %worker.worker_id, "Task moved from pending to worker");
        }
        Ok(None) if self.policy == SlotPolicy::SingleSlot => {
          // Either pending drained or the worker was filled since we looked.
          if self.store.length(&pending).await? == 0 {
            break;
          }
        }
        Ok(None) => break,
        Err(e) => {
          error!(worker_id = %worker.worker_id, error = %e, "Error dispatching task to worker");
          break;
        }
      }
    }
    Ok(moved)
  }

  pub async fn run_dispatch_loop(&self, interval: Duration) {
    info!(interval_ms = interval.as_millis() as u64, policy = ?self.policy, "Task scheduler started");
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      if let Err(e) = self.dispatch_once().await {
        error!(error = %e, "Error checking pending queue");
      }
    }
  }
}

fn least_loaded(workers: Vec<WorkerLoad>) -> Option<WorkerLoad> {
  let min_load = workers.iter().map(|w| w.load).min()?;
  let candidates: Vec<WorkerLoad> = workers.into_iter().filter(|w| w.load == min_load).collect();
  candidates.choose(&mut rand::thread_rng()).cloned()
}

pub(crate) fn task_id_of(task_json: &str) -> String {
  serde_json::from_str::<serde_json::Value>(task_json)
    .ok()
    .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
    .unwrap_or_else(|| "N/A".into())
}
