use std::sync::Arc;
use std::time::Duration;

use warp::Filter;

use crate::store::{Keyspace, QueueStore};
use crate::worker_scheduler::Scheduler;

pub mod sse;
pub mod status;
pub mod tasks;

/// Everything a request handler needs, cloned into each filter.
#[derive(Clone)]
pub struct AppState {
  pub store: Arc<dyn QueueStore>,
  pub scheduler: Arc<Scheduler>,
  pub keys: Keyspace,
  pub heartbeat_timeout: Duration,
}

pub fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = std::convert::Infallible> + Clone {
  warp::any().map(move || state.clone())
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let home = warp::path::end().and(warp::get()).map(|| "API is running");
  let cors = warp::cors()
    .allow_any_origin()
    .allow_methods(vec!["GET", "POST", "OPTIONS"])
    .allow_headers(vec!["content-type"]);

  home
    .or(tasks::submit_route(state.clone()))
    .or(status::queue_status_route(state.clone()))
    .or(status::system_status_route(state.clone()))
    .or(sse::sse_route(state))
    .with(cors)
}
