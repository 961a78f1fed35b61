use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("redis error: {0}")]
  Redis(#[from] redis::RedisError),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),

  #[error("unsupported store url: {0}")]
  UnsupportedUrl(String),

  #[error("store unavailable: {0}")]
  Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Rejections raised at the submission boundary before a task reaches the scheduler.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
  #[error("Invalid task format. Must be {{ task: {{ id: ..., payload: ... }} }}")]
  MissingTask,

  #[error("Task must contain 'id' and 'payload'")]
  MissingField,

  #[error("Invalid task kind '{0}'")]
  InvalidKind(String),
}
