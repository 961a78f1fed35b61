use std::time::Duration;

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use super::QueueStore;
use crate::error::StoreResult;

static MIGRATOR: Migrator = sqlx::migrate!();

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const MOVE_HEAD: &str = r#"
  WITH head AS (
    DELETE FROM queue_items
    WHERE id = (
      SELECT id FROM queue_items
      WHERE queue = $1
      ORDER BY id
      LIMIT 1
      FOR UPDATE SKIP LOCKED
    )
    RETURNING item
  )
  INSERT INTO queue_items (queue, item)
  SELECT $2, item FROM head
  RETURNING item
"#;

/// Queue store on PostgreSQL. Queue items are rows ordered by a serial id;
/// row locks with `SKIP LOCKED` make a head-of-queue move a single atomic
/// statement, and claim-slot operations serialize on an advisory lock per queue.
pub struct PgStore {
  pool: Pool<Postgres>,
}

impl PgStore {
  pub async fn connect(database_url: &str) -> StoreResult<Self> {
    let pool = Pool::<Postgres>::connect(database_url).await?;
    MIGRATOR.run(&pool).await?;
    info!("Database migrations complete");
    Ok(Self { pool })
  }

  async fn move_head(&self, src: &str, dst: &str) -> StoreResult<Option<String>> {
    let moved = sqlx::query_scalar::<_, String>(MOVE_HEAD)
      .bind(src)
      .bind(dst)
      .fetch_optional(&self.pool)
      .await?;
    Ok(moved)
  }

  /// Drop entries past their TTL. Reads already ignore them; this keeps
  /// heartbeats of departed workers from accumulating.
  async fn purge_expired(&self) -> StoreResult<u64> {
    let purged = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= now()")
      .execute(&self.pool)
      .await?
      .rows_affected();
    if purged > 0 {
      debug!(purged, "Purged expired entries");
    }
    Ok(purged)
  }
}

#[async_trait]
impl QueueStore for PgStore {
  async fn push(&self, queue: &str, item: &str) -> StoreResult<()> {
    sqlx::query("INSERT INTO queue_items (queue, item) VALUES ($1, $2)")
      .bind(queue)
      .bind(item)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn push_if_empty(&self, queue: &str, item: &str) -> StoreResult<bool> {
    let mut tx = self.pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
      .bind(queue)
      .execute(&mut *tx)
      .await?;
    let inserted = sqlx::query(
      r#"
      INSERT INTO queue_items (queue, item)
      SELECT $1, $2
      WHERE NOT EXISTS (SELECT 1 FROM queue_items WHERE queue = $1)
      "#,
    )
      .bind(queue)
      .bind(item)
      .execute(&mut *tx)
      .await?
      .rows_affected();
    tx.commit().await?;
    Ok(inserted == 1)
  }

  async fn pop(&self, queue: &str) -> StoreResult<Option<String>> {
    let item = sqlx::query_scalar::<_, String>(
      r#"
      DELETE FROM queue_items
      WHERE id = (
        SELECT id FROM queue_items
        WHERE queue = $1
        ORDER BY id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
      )
      RETURNING item
      "#,
    )
      .bind(queue)
      .fetch_optional(&self.pool)
      .await?;
    Ok(item)
  }

  async fn peek(&self, queue: &str) -> StoreResult<Option<String>> {
    let item = sqlx::query_scalar::<_, String>(
      "SELECT item FROM queue_items WHERE queue = $1 ORDER BY id LIMIT 1",
    )
      .bind(queue)
      .fetch_optional(&self.pool)
      .await?;
    Ok(item)
  }

  async fn transfer(&self, src: &str, dst: &str, timeout: Duration) -> StoreResult<Option<String>> {
    let deadline = Instant::now() + timeout;
    loop {
      if let Some(item) = self.move_head(src, dst).await? {
        return Ok(Some(item));
      }
      let now = Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
  }

  async fn transfer_if_empty(&self, src: &str, dst: &str) -> StoreResult<Option<String>> {
    let mut tx = self.pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
      .bind(dst)
      .execute(&mut *tx)
      .await?;
    let occupied = sqlx::query_scalar::<_, bool>(
      "SELECT EXISTS (SELECT 1 FROM queue_items WHERE queue = $1)",
    )
      .bind(dst)
      .fetch_one(&mut *tx)
      .await?;
    if occupied {
      tx.rollback().await?;
      return Ok(None);
    }
    let moved = sqlx::query_scalar::<_, String>(MOVE_HEAD)
      .bind(src)
      .bind(dst)
      .fetch_optional(&mut *tx)
      .await?;
    tx.commit().await?;
    Ok(moved)
  }

  async fn length(&self, queue: &str) -> StoreResult<usize> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_items WHERE queue = $1")
      .bind(queue)
      .fetch_one(&self.pool)
      .await?;
    Ok(usize::try_from(count).unwrap_or(0))
  }

  async fn range(&self, queue: &str, limit: usize) -> StoreResult<Vec<String>> {
    let items = sqlx::query_scalar::<_, String>(
      "SELECT item FROM queue_items WHERE queue = $1 ORDER BY id LIMIT $2",
    )
      .bind(queue)
      .bind(i64::try_from(limit).unwrap_or(i64::MAX))
      .fetch_all(&self.pool)
      .await?;
    Ok(items)
  }

  async fn remove_one(&self, queue: &str, item: &str) -> StoreResult<bool> {
    let removed = sqlx::query(
      r#"
      DELETE FROM queue_items
      WHERE id = (
        SELECT id FROM queue_items
        WHERE queue = $1 AND item = $2
        ORDER BY id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
      )
      "#,
    )
      .bind(queue)
      .bind(item)
      .execute(&self.pool)
      .await?
      .rows_affected();
    Ok(removed > 0)
  }

  async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
    self.purge_expired().await?;
    let keys = sqlx::query_scalar::<_, String>(
      r#"
      SELECT key FROM kv_entries
      WHERE starts_with(key, $1) AND expires_at > now()
      UNION
      SELECT DISTINCT queue FROM queue_items
      WHERE starts_with(queue, $1)
      ORDER BY 1
      "#,
    )
      .bind(prefix)
      .fetch_all(&self.pool)
      .await?;
    Ok(keys)
  }

  async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
    sqlx::query(
      r#"
      INSERT INTO kv_entries (key, value, expires_at)
      VALUES ($1, $2, now() + make_interval(secs => $3))
      ON CONFLICT (key) DO UPDATE
      SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
      "#,
    )
      .bind(key)
      .bind(value)
      .bind(ttl.as_secs_f64())
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn get(&self, key: &str) -> StoreResult<Option<String>> {
    let value = sqlx::query_scalar::<_, String>(
      "SELECT value FROM kv_entries WHERE key = $1 AND expires_at > now()",
    )
      .bind(key)
      .fetch_optional(&self.pool)
      .await?;
    Ok(value)
  }

  async fn delete(&self, key: &str) -> StoreResult<()> {
    let mut tx = self.pool.begin().await?;
    sqlx::query("DELETE FROM kv_entries WHERE key = $1")
      .bind(key)
      .execute(&mut *tx)
      .await?;
    sqlx::query("DELETE FROM queue_items WHERE queue = $1")
      .bind(key)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use uuid::Uuid;

  #[tokio::test]
  #[ignore = "requires DATABASE_URL pointing at a live Postgres"]
  async fn listing_keys_purges_expired_rows() {
    let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/taskmesh".into());
    let store = PgStore::connect(&url).await.unwrap();
    let prefix = format!("purge-{}:", Uuid::new_v4());
    let stale = format!("{prefix}heartbeat:gone");
    let fresh = format!("{prefix}heartbeat:here");
    store.set(&stale, "{}", Duration::from_millis(10)).await.unwrap();
    store.set(&fresh, "{}", Duration::from_secs(60)).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(store.list_keys(&prefix).await.unwrap(), vec![fresh.clone()]);

    let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM kv_entries WHERE starts_with(key, $1)")
      .bind(&prefix)
      .fetch_one(&store.pool)
      .await
      .unwrap();
    assert_eq!(rows, 1);
    store.delete(&fresh).await.unwrap();
  }
}
