use std::fmt;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SubmitError;

static KIND_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("kind pattern is valid")
});

/// Current wall-clock time as float epoch seconds.
pub fn now_epoch() -> f64 {
  Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub payload: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub submit_timestamp: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub processing_start_timestamp: Option<f64>,
}

impl Task {
  pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      payload: payload.into(),
      kind: None,
      submit_timestamp: None,
      processing_start_timestamp: None,
    }
  }

  pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
    self.kind = Some(kind.into());
    self
  }

  /// Stamps the submission time unless the caller already supplied one.
  pub fn ensure_submitted(&mut self) {
    if self.submit_timestamp.is_none() {
      self.submit_timestamp = Some(now_epoch());
    }
  }

  pub fn to_json(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }
}

/// The exact bytes a queue item was stored as. Removal always goes through the
/// receipt so a parsed-and-reserialized task never has to match byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt(String);

impl Receipt {
  pub fn new(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Receipt {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone)]
pub struct QueuedTask {
  pub task: Task,
  pub receipt: Receipt,
}

impl QueuedTask {
  pub fn parse(raw: String) -> serde_json::Result<Self> {
    let task = serde_json::from_str::<Task>(&raw)?;
    Ok(Self { task, receipt: Receipt(raw) })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
  Idle,
  Processing,
}

impl WorkerStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerStatus::Idle => "idle",
      WorkerStatus::Processing => "processing",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
  pub worker_id: String,
  pub processing_queue: String,
  pub status: WorkerStatus,
  #[serde(default)]
  pub current_task_id: Option<String>,
  pub last_heartbeat: f64,
}

impl HeartbeatRecord {
  pub fn new(worker_id: &str, processing_queue: &str, current_task_id: Option<&str>) -> Self {
    Self {
      worker_id: worker_id.to_string(),
      processing_queue: processing_queue.to_string(),
      status: if current_task_id.is_some() { WorkerStatus::Processing } else { WorkerStatus::Idle },
      current_task_id: current_task_id.map(str::to_string),
      last_heartbeat: now_epoch(),
    }
  }

  /// Records missing a worker or queue name are unusable for scheduling or reclamation.
  pub fn is_complete(&self) -> bool {
    !self.worker_id.is_empty() && !self.processing_queue.is_empty()
  }

  pub fn is_expired(&self, now: f64, timeout_secs: f64) -> bool {
    now - self.last_heartbeat > timeout_secs
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
  pub id: Option<String>,
  pub payload: Option<String>,
  pub kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitRequest {
  pub task: Option<NewTask>,
}

impl SubmitRequest {
  pub fn into_task(self) -> Result<Task, SubmitError> {
    self.task.ok_or(SubmitError::MissingTask)?.validate()
  }
}

impl NewTask {
  pub fn validate(self) -> Result<Task, SubmitError> {
    let id = self.id.filter(|v| !v.is_empty()).ok_or(SubmitError::MissingField)?;
    let payload = self.payload.filter(|v| !v.is_empty()).ok_or(SubmitError::MissingField)?;
    let mut task = Task::new(id, payload);
    if let Some(kind) = self.kind.filter(|v| !v.is_empty()) {
      if !KIND_PATTERN.is_match(&kind) {
        return Err(SubmitError::InvalidKind(kind));
      }
      task.kind = Some(kind);
    }
    Ok(task)
  }
}
