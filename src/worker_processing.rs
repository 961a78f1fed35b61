use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::info;

use crate::models::Task;

/// The body of a task. Errors are routed to the failed queue by the worker runtime.
#[async_trait]
pub trait TaskHandler: Send + Sync {
  async fn execute(&self, task: &Task) -> Result<String>;
}

/// Routes tasks to handlers by `kind`, falling back to a default handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
  handlers: HashMap<String, Arc<dyn TaskHandler>>,
  fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_default<H: TaskHandler + 'static>(handler: H) -> Self {
    Self {
      handlers: HashMap::new(),
      fallback: Some(Arc::new(handler)),
    }
  }

  pub fn register<H: TaskHandler + 'static>(&mut self, kind: impl Into<String>, handler: H) -> &mut Self {
    self.handlers.insert(kind.into(), Arc::new(handler));
    self
  }

  pub fn kinds(&self) -> Vec<String> {
    let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
    kinds.sort();
    kinds
  }

  fn resolve(&self, task: &Task) -> Option<Arc<dyn TaskHandler>> {
    task
      .kind
      .as_deref()
      .and_then(|kind| self.handlers.get(kind).cloned())
      .or_else(|| self.fallback.clone())
  }

  pub async fn execute(&self, task: &Task) -> Result<String> {
    let handler = self.resolve(task).ok_or_else(|| {
      anyhow!("No handler registered for task kind '{}'", task.kind.as_deref().unwrap_or("default"))
    })?;
    handler.execute(task).await
  }
}

/// Stand-in workload: sleeps for a random duration within the configured range.
pub struct SimulatedWorkHandler {
  min: Duration,
  max: Duration,
}

impl SimulatedWorkHandler {
  pub fn new(min: Duration, max: Duration) -> Self {
    Self { min, max: max.max(min) }
  }
}

#[async_trait]
impl TaskHandler for SimulatedWorkHandler {
  async fn execute(&self, task: &Task) -> Result<String> {
    let span = (self.max - self.min).as_millis() as u64;
    let extra = if span == 0 { 0 } else { rand::thread_rng().gen_range(0..=span) };
    let duration = self.min + Duration::from_millis(extra);
    info!(task_id = %task.id, duration_ms = duration.as_millis() as u64, "Simulating work");
    sleep(duration).await;
    Ok("Generic success".into())
  }
}

pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
  async fn execute(&self, task: &Task) -> Result<String> {
    Ok(task.payload.clone())
  }
}
