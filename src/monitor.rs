use anyhow::Result;
use taskmesh::config::Config;
use taskmesh::heartbeat_monitor::HeartbeatMonitor;
use taskmesh::store::connect;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let store = connect(&config.store_url).await?;
  let monitor = HeartbeatMonitor::new(store, config.keyspace(), config.heartbeat_timeout);
  monitor.run(config.monitor_interval).await;
  Ok(())
}
