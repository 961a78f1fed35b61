use std::sync::Arc;

use anyhow::Result;
use taskmesh::config::Config;
use taskmesh::heartbeat_monitor::HeartbeatMonitor;
use taskmesh::routes::{AppState, routes};
use taskmesh::store::connect;
use taskmesh::worker_processing::{HandlerRegistry, SimulatedWorkHandler};
use taskmesh::worker_runtime::{Worker, WorkerSettings};
use taskmesh::worker_scheduler::Scheduler;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let keys = config.keyspace();
  let store = connect(&config.store_url).await?;

  let scheduler = Arc::new(Scheduler::new(
    store.clone(),
    keys.clone(),
    config.slot_policy,
    config.heartbeat_timeout,
  ));
  {
    let scheduler = scheduler.clone();
    let interval = config.dispatch_interval;
    tokio::spawn(async move { scheduler.run_dispatch_loop(interval).await });
  }

  if config.embedded_workers > 0 {
    info!(workers = config.embedded_workers, "Starting embedded workers and monitor");
    let monitor = HeartbeatMonitor::new(store.clone(), keys.clone(), config.heartbeat_timeout);
    let monitor_interval = config.monitor_interval;
    tokio::spawn(async move { monitor.run(monitor_interval).await });

    for index in 1..=config.embedded_workers {
      let handlers = HandlerRegistry::with_default(SimulatedWorkHandler::new(config.work_min, config.work_max));
      let mut settings = WorkerSettings::from_config(&config);
      settings.worker_id = format!("{}-{index}", config.worker_id);
      let mut worker = Worker::new(store.clone(), keys.clone(), handlers, settings);
      tokio::spawn(async move { worker.run().await });
    }
  }

  let state = AppState {
    store,
    scheduler,
    keys,
    heartbeat_timeout: config.heartbeat_timeout,
  };
  info!(port = config.server_port, "Submission API listening");
  warp::serve(routes(state))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
