use anyhow::Result;
use taskmesh::config::Config;
use taskmesh::store::connect;
use taskmesh::worker_processing::{EchoHandler, HandlerRegistry, SimulatedWorkHandler};
use taskmesh::worker_runtime::{Worker, WorkerSettings};
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let mut config = Config::from_env()?;
  if let Some(index) = std::env::args().nth(1) {
    config = config.with_worker_index(&index)?;
  }
  let store = connect(&config.store_url).await?;

  let mut handlers = HandlerRegistry::with_default(SimulatedWorkHandler::new(config.work_min, config.work_max));
  handlers.register("echo", EchoHandler);
  info!(kinds = ?handlers.kinds(), "Registered task handlers");

  let mut worker = Worker::new(store, config.keyspace(), handlers, WorkerSettings::from_config(&config));

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("Shutdown requested, finishing current task");
      let _ = shutdown_tx.send(true);
    }
  });

  worker.run_until(shutdown_rx).await;
  Ok(())
}
