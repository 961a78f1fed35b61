use std::env;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use uuid::Uuid;

use crate::store::Keyspace;
use crate::worker_scheduler::SlotPolicy;

static WORKER_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("worker id pattern is valid")
});

#[derive(Debug, Clone)]
pub struct Config {
  pub store_url: String,
  pub server_port: u16,
  pub key_prefix: String,
  pub worker_id: String,
  pub heartbeat_interval: Duration,
  pub heartbeat_timeout: Duration,
  pub monitor_interval: Duration,
  pub dispatch_interval: Duration,
  pub worker_poll: Duration,
  pub worker_backoff: Duration,
  pub slot_policy: SlotPolicy,
  pub embedded_workers: usize,
  pub work_min: Duration,
  pub work_max: Duration,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let worker_id = match (lookup("WORKER_ID"), lookup("WORKER_INDEX")) {
      (Some(id), _) if !id.trim().is_empty() => id.trim().to_string(),
      (_, Some(index)) if !index.trim().is_empty() => format!("Worker-{}", index.trim()),
      _ => format!("worker-{}", Uuid::new_v4()),
    };
    validate_worker_id(&worker_id)?;

    let config = Self {
      store_url: lookup("QUEUE_STORE_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
      server_port: parse_or(&lookup, "SERVER_PORT", 5000)?,
      key_prefix: lookup("KEY_PREFIX").unwrap_or_default(),
      worker_id,
      heartbeat_interval: Duration::from_secs(parse_or(&lookup, "HEARTBEAT_INTERVAL_SECS", 6)?),
      heartbeat_timeout: Duration::from_secs(parse_or(&lookup, "HEARTBEAT_TIMEOUT_SECS", 10)?),
      monitor_interval: Duration::from_secs(parse_or(&lookup, "MONITOR_INTERVAL_SECS", 2)?),
      dispatch_interval: Duration::from_millis(parse_or(&lookup, "DISPATCH_INTERVAL_MS", 1000)?),
      worker_poll: Duration::from_millis(parse_or(&lookup, "WORKER_POLL_MS", 1000)?),
      worker_backoff: Duration::from_secs(parse_or(&lookup, "WORKER_BACKOFF_SECS", 5)?),
      slot_policy: parse_or(&lookup, "SLOT_POLICY", SlotPolicy::SingleSlot)?,
      embedded_workers: parse_or(&lookup, "EMBEDDED_WORKERS", 0)?,
      work_min: Duration::from_millis(parse_or(&lookup, "WORK_MIN_MS", 1000)?),
      work_max: Duration::from_millis(parse_or(&lookup, "WORK_MAX_MS", 3000)?),
    };

    for (key, value) in [
      ("HEARTBEAT_INTERVAL_SECS", config.heartbeat_interval),
      ("MONITOR_INTERVAL_SECS", config.monitor_interval),
      ("DISPATCH_INTERVAL_MS", config.dispatch_interval),
      ("WORKER_POLL_MS", config.worker_poll),
    ] {
      if value.is_zero() {
        bail!("{key} must be positive");
      }
    }
    // A live worker is at most one interval behind; a shorter timeout reclaims
    // tasks it is still running.
    if config.heartbeat_timeout <= config.heartbeat_interval {
      bail!("HEARTBEAT_TIMEOUT_SECS must exceed HEARTBEAT_INTERVAL_SECS");
    }
    if config.work_min > config.work_max {
      bail!("WORK_MIN_MS must not exceed WORK_MAX_MS");
    }
    Ok(config)
  }

  /// Name the worker `Worker-<index>`, as `WORKER_INDEX` would.
  pub fn with_worker_index(mut self, index: &str) -> Result<Self> {
    let worker_id = format!("Worker-{}", index.trim());
    validate_worker_id(&worker_id)?;
    self.worker_id = worker_id;
    Ok(self)
  }

  pub fn keyspace(&self) -> Keyspace {
    Keyspace::new(&self.key_prefix)
  }
}

fn validate_worker_id(worker_id: &str) -> Result<()> {
  if !WORKER_ID_PATTERN.is_match(worker_id) {
    bail!("WORKER_ID '{worker_id}' may only contain letters, digits, '_', '.' and '-'");
  }
  Ok(())
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
  F: Fn(&str) -> Option<String>,
{
  match lookup(key) {
    Some(raw) if !raw.trim().is_empty() => raw
      .trim()
      .parse()
      .with_context(|| format!("invalid value for {key}: '{raw}'")),
    _ => Ok(default),
  }
}
