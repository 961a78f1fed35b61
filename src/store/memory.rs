use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::QueueStore;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct Inner {
  queues: HashMap<String, VecDeque<String>>,
  entries: HashMap<String, (String, Instant)>,
  offline: bool,
}

impl Inner {
  fn check(&self) -> StoreResult<()> {
    if self.offline {
      return Err(StoreError::Unavailable("memory store taken offline".into()));
    }
    Ok(())
  }

  fn push_back(&mut self, queue: &str, item: String) {
    self.queues.entry(queue.to_string()).or_default().push_back(item);
  }

  fn pop_front(&mut self, queue: &str) -> Option<String> {
    let list = self.queues.get_mut(queue)?;
    let item = list.pop_front();
    if list.is_empty() {
      self.queues.remove(queue);
    }
    item
  }

  fn len(&self, queue: &str) -> usize {
    self.queues.get(queue).map_or(0, VecDeque::len)
  }

  fn purge_expired(&mut self) {
    let now = Instant::now();
    self.entries.retain(|_, (_, expires_at)| *expires_at > now);
  }
}

/// In-process store with the same atomicity as the networked backends: every
/// operation runs under one lock, so transfers are never observed half-done.
#[derive(Debug, Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
  pushed: Notify,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Simulate store unavailability: every call fails until brought back online.
  pub async fn set_offline(&self, offline: bool) {
    self.inner.lock().await.offline = offline;
  }

  /// Full contents of `queue`, head first.
  pub async fn snapshot(&self, queue: &str) -> Vec<String> {
    let inner = self.inner.lock().await;
    inner.queues.get(queue).map(|q| q.iter().cloned().collect()).unwrap_or_default()
  }

  /// Every non-empty queue, read under one lock so no transfer is seen half-done.
  pub async fn snapshot_all(&self) -> HashMap<String, Vec<String>> {
    let inner = self.inner.lock().await;
    inner.queues.iter().map(|(name, items)| (name.clone(), items.iter().cloned().collect())).collect()
  }

  async fn try_transfer(&self, src: &str, dst: &str) -> StoreResult<Option<String>> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    let Some(item) = inner.pop_front(src) else {
      return Ok(None);
    };
    inner.push_back(dst, item.clone());
    drop(inner);
    self.pushed.notify_waiters();
    Ok(Some(item))
  }
}

#[async_trait]
impl QueueStore for MemoryStore {
  async fn push(&self, queue: &str, item: &str) -> StoreResult<()> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    inner.push_back(queue, item.to_string());
    drop(inner);
    self.pushed.notify_waiters();
    Ok(())
  }

  async fn push_if_empty(&self, queue: &str, item: &str) -> StoreResult<bool> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    if inner.len(queue) > 0 {
      return Ok(false);
    }
    inner.push_back(queue, item.to_string());
    drop(inner);
    self.pushed.notify_waiters();
    Ok(true)
  }

  async fn pop(&self, queue: &str) -> StoreResult<Option<String>> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    Ok(inner.pop_front(queue))
  }

  async fn peek(&self, queue: &str) -> StoreResult<Option<String>> {
    let inner = self.inner.lock().await;
    inner.check()?;
    Ok(inner.queues.get(queue).and_then(|q| q.front().cloned()))
  }

  async fn transfer(&self, src: &str, dst: &str, timeout: Duration) -> StoreResult<Option<String>> {
    let deadline = Instant::now() + timeout;
    loop {
      let notified = self.pushed.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(item) = self.try_transfer(src, dst).await? {
        return Ok(Some(item));
      }
      if Instant::now() >= deadline {
        return Ok(None);
      }
      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return self.try_transfer(src, dst).await;
      }
    }
  }

  async fn transfer_if_empty(&self, src: &str, dst: &str) -> StoreResult<Option<String>> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    if inner.len(dst) > 0 {
      return Ok(None);
    }
    let Some(item) = inner.pop_front(src) else {
      return Ok(None);
    };
    inner.push_back(dst, item.clone());
    drop(inner);
    self.pushed.notify_waiters();
    Ok(Some(item))
  }

  async fn length(&self, queue: &str) -> StoreResult<usize> {
    let inner = self.inner.lock().await;
    inner.check()?;
    Ok(inner.len(queue))
  }

  async fn range(&self, queue: &str, limit: usize) -> StoreResult<Vec<String>> {
    let inner = self.inner.lock().await;
    inner.check()?;
    Ok(inner.queues.get(queue).map(|q| q.iter().take(limit).cloned().collect()).unwrap_or_default())
  }

  async fn remove_one(&self, queue: &str, item: &str) -> StoreResult<bool> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    let Some(list) = inner.queues.get_mut(queue) else {
      return Ok(false);
    };
    let Some(position) = list.iter().position(|stored| stored == item) else {
      return Ok(false);
    };
    list.remove(position);
    if list.is_empty() {
      inner.queues.remove(queue);
    }
    Ok(true)
  }

  async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    inner.purge_expired();
    let mut keys: Vec<String> = inner
      .entries
      .keys()
      .chain(inner.queues.keys())
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect();
    keys.sort();
    keys.dedup();
    Ok(keys)
  }

  async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    inner.entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    Ok(())
  }

  async fn get(&self, key: &str) -> StoreResult<Option<String>> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    inner.purge_expired();
    Ok(inner.entries.get(key).map(|(value, _)| value.clone()))
  }

  async fn delete(&self, key: &str) -> StoreResult<()> {
    let mut inner = self.inner.lock().await;
    inner.check()?;
    inner.entries.remove(key);
    inner.queues.remove(key);
    Ok(())
  }
}
