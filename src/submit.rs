use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use rand::Rng;
use taskmesh::client::ApiClient;
use tracing::{error, info};

const DEFAULT_COUNT: usize = 20;
const STAGGER: Duration = Duration::from_millis(50);

/// Submits a batch of tasks concurrently: `taskmesh_submit [count] [kind]`.
#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let api_url = std::env::var("API_URL").unwrap_or_else(|_| "http://127.0.0.1:5000".into());
  let mut args = std::env::args().skip(1);
  let count = match args.next() {
    Some(raw) => raw.parse()?,
    None => DEFAULT_COUNT,
  };
  let kind = args.next();
  let client = ApiClient::new(&api_url);

  let mut submissions = Vec::with_capacity(count);
  for i in 1..=count {
    let client = client.clone();
    let kind = kind.clone();
    let task_id = format!("T{i:03}");
    let payload = format!("Random number: {}", rand::thread_rng().gen_range(1000..10000));
    submissions.push(tokio::spawn(async move {
      match client.submit(&task_id, &payload, kind.as_deref()).await {
        Ok(response) => {
          info!(task_id = %task_id, assigned_to = ?response.assigned_to, "{}", response.message);
          true
        }
        Err(e) => {
          error!(task_id = %task_id, error = %e, "Submission failed");
          false
        }
      }
    }));
    tokio::time::sleep(STAGGER).await;
  }

  let accepted = join_all(submissions)
    .await
    .into_iter()
    .filter(|result| matches!(result, Ok(true)))
    .count();
  info!(accepted, total = count, "Submission batch finished");
  Ok(())
}
