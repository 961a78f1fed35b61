//! Redis/Valkey-backed queue store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::FromRedisValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::QueueStore;
use crate::error::{StoreError, StoreResult};

const SCAN_BATCH: usize = 200;

const PUSH_IF_EMPTY_SCRIPT: &str = r#"
if redis.call("LLEN", KEYS[1]) > 0 then
  return 0
end
redis.call("RPUSH", KEYS[1], ARGV[1])
return 1
"#;

const TRANSFER_IF_EMPTY_SCRIPT: &str = r#"
if redis.call("LLEN", KEYS[2]) > 0 then
  return false
end
return redis.call("LMOVE", KEYS[1], KEYS[2], "LEFT", "RIGHT")
"#;

/// Whether a command may be sent again after an error. The server may have
/// applied the first attempt before the reply was lost, so anything that adds,
/// moves or removes a queue item is sent exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
  Safe,
  Never,
}

impl Replay {
  fn attempts(self) -> usize {
    match self {
      Replay::Safe => 2,
      Replay::Never => 1,
    }
  }
}

pub struct RedisStore {
  client: redis::Client,
  connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
}

impl RedisStore {
  pub async fn connect(url: &str) -> StoreResult<Self> {
    let client = redis::Client::open(url)?;
    let store = Self {
      client,
      connection: Arc::new(Mutex::new(None)),
    };
    store.run_command::<String, _>("ping", Replay::Safe, || redis::cmd("PING")).await?;
    Ok(store)
  }

  async fn ensure_connection(
    &self,
    connection: &mut Option<redis::aio::MultiplexedConnection>,
  ) -> StoreResult<()> {
    if connection.is_some() {
      return Ok(());
    }
    *connection = Some(self.client.get_multiplexed_async_connection().await?);
    debug!("redis queue store connected");
    Ok(())
  }

  /// Run a command. On failure the connection is dropped; only `Replay::Safe`
  /// commands are sent again on a fresh one.
  async fn run_command<T, F>(&self, operation: &'static str, replay: Replay, build: F) -> StoreResult<T>
  where
    T: FromRedisValue + Send,
    F: Fn() -> redis::Cmd,
  {
    let mut last_err: Option<redis::RedisError> = None;
    for attempt in 0..replay.attempts() {
      let mut conn_guard = self.connection.lock().await;
      self.ensure_connection(&mut conn_guard).await?;
      let conn = conn_guard
        .as_mut()
        .ok_or_else(|| StoreError::Unavailable("redis connection unavailable".into()))?;
      let result: redis::RedisResult<T> = build().query_async(conn).await;
      match result {
        Ok(value) => return Ok(value),
        Err(err) => {
          warn!(operation, attempt = attempt + 1, ?replay, error = %err, "redis command failed; dropping connection");
          *conn_guard = None;
          last_err = Some(err);
        }
      }
    }
    Err(last_err
      .map(StoreError::from)
      .unwrap_or_else(|| StoreError::Unavailable(format!("redis {operation} failed"))))
  }
}

#[async_trait]
impl QueueStore for RedisStore {
  async fn push(&self, queue: &str, item: &str) -> StoreResult<()> {
    self
      .run_command::<(), _>("push", Replay::Never, || {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(queue).arg(item);
        cmd
      })
      .await
  }

  async fn push_if_empty(&self, queue: &str, item: &str) -> StoreResult<bool> {
    // A replay after an applied claim would see the slot taken, and the
    // caller would then queue a second copy.
    let claimed = self
      .run_command::<i64, _>("push_if_empty", Replay::Never, || {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(PUSH_IF_EMPTY_SCRIPT).arg(1).arg(queue).arg(item);
        cmd
      })
      .await?;
    Ok(claimed == 1)
  }

  async fn pop(&self, queue: &str) -> StoreResult<Option<String>> {
    self
      .run_command("pop", Replay::Never, || {
        let mut cmd = redis::cmd("LPOP");
        cmd.arg(queue);
        cmd
      })
      .await
  }

  async fn peek(&self, queue: &str) -> StoreResult<Option<String>> {
    self
      .run_command("peek", Replay::Safe, || {
        let mut cmd = redis::cmd("LINDEX");
        cmd.arg(queue).arg(0);
        cmd
      })
      .await
  }

  async fn transfer(&self, src: &str, dst: &str, timeout: Duration) -> StoreResult<Option<String>> {
    if timeout.is_zero() {
      return self
        .run_command("transfer", Replay::Never, || {
          let mut cmd = redis::cmd("LMOVE");
          cmd.arg(src).arg(dst).arg("LEFT").arg("RIGHT");
          cmd
        })
        .await;
    }
    // A blocking call would stall every other command multiplexed on the shared
    // connection, so it gets a connection of its own.
    let mut conn = self.client.get_multiplexed_async_connection().await?;
    let moved: Option<String> = redis::cmd("BLMOVE")
      .arg(src)
      .arg(dst)
      .arg("LEFT")
      .arg("RIGHT")
      .arg(timeout.as_secs_f64())
      .query_async(&mut conn)
      .await?;
    Ok(moved)
  }

  async fn transfer_if_empty(&self, src: &str, dst: &str) -> StoreResult<Option<String>> {
    // A replayed move finds `dst` occupied and moves nothing.
    self
      .run_command("transfer_if_empty", Replay::Safe, || {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(TRANSFER_IF_EMPTY_SCRIPT).arg(2).arg(src).arg(dst);
        cmd
      })
      .await
  }

  async fn length(&self, queue: &str) -> StoreResult<usize> {
    self
      .run_command("length", Replay::Safe, || {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(queue);
        cmd
      })
      .await
  }

  async fn range(&self, queue: &str, limit: usize) -> StoreResult<Vec<String>> {
    if limit == 0 {
      return Ok(Vec::new());
    }
    let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
    self
      .run_command("range", Replay::Safe, || {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(queue).arg(0).arg(stop);
        cmd
      })
      .await
  }

  async fn remove_one(&self, queue: &str, item: &str) -> StoreResult<bool> {
    let removed = self
      .run_command::<i64, _>("remove_one", Replay::Never, || {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(queue).arg(1).arg(item);
        cmd
      })
      .await?;
    Ok(removed > 0)
  }

  async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
    let pattern = format!("{prefix}*");
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
      let (next, batch): (u64, Vec<String>) = self
        .run_command("list_keys", Replay::Safe, || {
          let mut cmd = redis::cmd("SCAN");
          cmd.arg(cursor).arg("MATCH").arg(&pattern).arg("COUNT").arg(SCAN_BATCH);
          cmd
        })
        .await?;
      keys.extend(batch);
      if next == 0 {
        break;
      }
      cursor = next;
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
  }

  async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
    self
      .run_command::<(), _>("set", Replay::Safe, || {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_ms);
        cmd
      })
      .await
  }

  async fn get(&self, key: &str) -> StoreResult<Option<String>> {
    self
      .run_command("get", Replay::Safe, || {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        cmd
      })
      .await
  }

  async fn delete(&self, key: &str) -> StoreResult<()> {
    self
      .run_command::<(), _>("delete", Replay::Safe, || {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        cmd
      })
      .await
  }
}
