//! Behaviour every queue store backend must share. The in-memory store runs
//! always; the Redis and Postgres runs need a live server:
//!
//!   REDIS_URL=redis://127.0.0.1:6379 cargo test --test store_contract -- --ignored
//!   DATABASE_URL=postgres://localhost/taskmesh cargo test --test store_contract -- --ignored

use std::time::Duration;

use taskmesh::store::{MemoryStore, PgStore, QueueStore, RedisStore};
use tokio_test::assert_ok;
use uuid::Uuid;

async fn contract(store: &dyn QueueStore) {
  // Unique names so repeated runs against a shared server don't collide.
  let ns = format!("contract-{}:", Uuid::new_v4());
  let src = format!("{ns}src");
  let dst = format!("{ns}dst");
  let slot = format!("{ns}slot");

  // FIFO
  for item in ["a", "b", "c"] {
    assert_ok!(store.push(&src, item).await);
  }
  assert_eq!(assert_ok!(store.length(&src).await), 3);
  assert_eq!(assert_ok!(store.peek(&src).await).as_deref(), Some("a"));
  assert_eq!(assert_ok!(store.range(&src, 2).await), vec!["a", "b"]);
  assert_eq!(assert_ok!(store.range(&src, 10).await), vec!["a", "b", "c"]);

  // transfer moves head to tail
  assert_ok!(store.push(&dst, "x").await);
  assert_eq!(assert_ok!(store.transfer(&src, &dst, Duration::ZERO).await).as_deref(), Some("a"));
  assert_eq!(assert_ok!(store.range(&dst, 10).await), vec!["x", "a"]);
  assert_eq!(assert_ok!(store.pop(&src).await).as_deref(), Some("b"));

  // conditional claims
  assert_eq!(assert_ok!(store.transfer_if_empty(&src, &dst).await), None);
  assert!(assert_ok!(store.push_if_empty(&slot, "first").await));
  assert!(!assert_ok!(store.push_if_empty(&slot, "second").await));
  assert_eq!(assert_ok!(store.range(&slot, 10).await), vec!["first"]);
  assert_eq!(assert_ok!(store.pop(&slot).await).as_deref(), Some("first"));
  assert_eq!(assert_ok!(store.transfer_if_empty(&src, &slot).await).as_deref(), Some("c"));
  assert_eq!(assert_ok!(store.length(&src).await), 0);
  assert_eq!(assert_ok!(store.transfer(&src, &slot, Duration::ZERO).await), None);

  // exact-match removal takes only the first occurrence
  assert_ok!(store.push(&dst, "x").await);
  assert!(assert_ok!(store.remove_one(&dst, "x").await));
  assert_eq!(assert_ok!(store.range(&dst, 10).await), vec!["a", "x"]);
  assert!(!assert_ok!(store.remove_one(&dst, "missing").await));

  // expiring entries and key listing
  let hb = format!("{ns}heartbeat:w1");
  assert_ok!(store.set(&hb, r#"{"alive":true}"#, Duration::from_secs(30)).await);
  assert_eq!(assert_ok!(store.get(&hb).await).as_deref(), Some(r#"{"alive":true}"#));
  assert_eq!(assert_ok!(store.list_keys(&format!("{ns}heartbeat:")).await), vec![hb.clone()]);
  let mut queues = assert_ok!(store.list_keys(&ns).await);
  queues.sort();
  assert_eq!(queues, vec![dst.clone(), hb.clone(), slot.clone()]);

  assert_ok!(store.delete(&hb).await);
  assert_eq!(assert_ok!(store.get(&hb).await), None);
  assert_ok!(store.delete(&dst).await);
  assert_ok!(store.delete(&slot).await);
  assert!(assert_ok!(store.list_keys(&ns).await).is_empty());
}

async fn blocking_transfer(store: &dyn QueueStore) {
  let ns = format!("contract-{}:", Uuid::new_v4());
  let src = format!("{ns}src");
  let dst = format!("{ns}dst");

  let moved = assert_ok!(store.transfer(&src, &dst, Duration::from_millis(200)).await);
  assert_eq!(moved, None);

  assert_ok!(store.push(&src, "ready").await);
  let moved = assert_ok!(store.transfer(&src, &dst, Duration::from_secs(1)).await);
  assert_eq!(moved.as_deref(), Some("ready"));
  assert_ok!(store.delete(&dst).await);
}

#[tokio::test]
async fn memory_store_honours_contract() {
  let store = MemoryStore::new();
  contract(&store).await;
  blocking_transfer(&store).await;
}

#[tokio::test]
#[ignore = "requires REDIS_URL pointing at a live Redis or Valkey"]
async fn redis_store_honours_contract() {
  let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
  let store = assert_ok!(RedisStore::connect(&url).await);
  contract(&store).await;
  blocking_transfer(&store).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointing at a live Postgres"]
async fn postgres_store_honours_contract() {
  let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/taskmesh".into());
  let store = assert_ok!(PgStore::connect(&url).await);
  contract(&store).await;
  blocking_transfer(&store).await;
}

