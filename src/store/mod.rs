//! Shared queue store: the only place mutable state lives. Scheduler, workers
//! and monitor coordinate exclusively through the primitives below.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};

pub mod memory;
pub mod postgres;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;
pub use self::redis::RedisStore;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

#[async_trait]
pub trait QueueStore: Send + Sync {
  /// Append `item` to the tail of `queue`.
  async fn push(&self, queue: &str, item: &str) -> StoreResult<()>;

  /// Append `item` only if `queue` is currently empty. Returns whether the slot was claimed.
  async fn push_if_empty(&self, queue: &str, item: &str) -> StoreResult<bool>;

  /// Remove and return the head of `queue`.
  async fn pop(&self, queue: &str) -> StoreResult<Option<String>>;

  /// Return the head of `queue` without removing it.
  async fn peek(&self, queue: &str) -> StoreResult<Option<String>>;

  /// Atomically move the head of `src` to the tail of `dst`. A zero timeout never
  /// blocks; otherwise waits up to `timeout` for `src` to become non-empty.
  async fn transfer(&self, src: &str, dst: &str, timeout: Duration) -> StoreResult<Option<String>>;

  /// Atomically move the head of `src` to `dst`, but only while `dst` is empty.
  async fn transfer_if_empty(&self, src: &str, dst: &str) -> StoreResult<Option<String>>;

  async fn length(&self, queue: &str) -> StoreResult<usize>;

  /// Up to `limit` items from the head of `queue`.
  async fn range(&self, queue: &str, limit: usize) -> StoreResult<Vec<String>>;

  /// Remove the first item exactly equal to `item`. Returns false when nothing matched.
  async fn remove_one(&self, queue: &str, item: &str) -> StoreResult<bool>;

  /// Live keys (entries and non-empty queues) starting with `prefix`.
  async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

  async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

  async fn get(&self, key: &str) -> StoreResult<Option<String>>;

  /// Delete an entry or a queue of that name.
  async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Names of every queue and key the system touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
  prefix: String,
}

impl Default for Keyspace {
  fn default() -> Self {
    Self::new("")
  }
}

impl Keyspace {
  pub fn new(prefix: &str) -> Self {
    Self { prefix: prefix.to_string() }
  }

  pub fn pending(&self) -> String {
    format!("{}pending", self.prefix)
  }

  pub fn failed(&self) -> String {
    format!("{}failed", self.prefix)
  }

  pub fn processing_prefix(&self) -> String {
    format!("{}processing:", self.prefix)
  }

  pub fn processing(&self, worker_id: &str) -> String {
    format!("{}{}", self.processing_prefix(), worker_id)
  }

  pub fn heartbeat_prefix(&self) -> String {
    format!("{}heartbeat:", self.prefix)
  }

  pub fn heartbeat(&self, worker_id: &str) -> String {
    format!("{}{}", self.heartbeat_prefix(), worker_id)
  }

  /// Worker id encoded in a `processing:<id>` queue name.
  pub fn worker_of_processing<'a>(&self, queue: &'a str) -> Option<&'a str> {
    queue.strip_prefix(self.processing_prefix().as_str()).filter(|id| !id.is_empty())
  }
}

/// Open the store named by `url`, retrying the initial connection with backoff.
pub async fn connect(url: &str) -> StoreResult<Arc<dyn QueueStore>> {
  let scheme = url.split("://").next().unwrap_or_default();
  let store: Arc<dyn QueueStore> = match scheme {
    "memory" => {
      warn!("Using in-process memory store; state is not shared with other processes");
      Arc::new(MemoryStore::new())
    }
    "redis" | "rediss" => {
      let store = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
        RedisStore::connect(url)
      })
        .await?;
      Arc::new(store)
    }
    "postgres" | "postgresql" => {
      let store = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
        PgStore::connect(url)
      })
        .await?;
      Arc::new(store)
    }
    _ => return Err(StoreError::UnsupportedUrl(url.to_string())),
  };
  info!(backend = scheme, "Queue store connected");
  Ok(store)
}
