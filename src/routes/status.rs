use serde_json::json;
use tracing::error;
use warp::Filter;
use warp::http::StatusCode;

use super::{AppState, with_state};
use crate::status::{DEFAULT_SAMPLE, queue_status, system_status};

pub fn queue_status_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("queue_status")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_queue_status)
}

pub fn system_status_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("system_status")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_system_status)
}

async fn handle_queue_status(state: AppState) -> Result<warp::reply::WithStatus<warp::reply::Json>, warp::Rejection> {
  Ok(match queue_status(state.store.as_ref(), &state.keys, DEFAULT_SAMPLE).await {
    Ok(status) => warp::reply::with_status(warp::reply::json(&status), StatusCode::OK),
    Err(e) => unavailable(e),
  })
}

async fn handle_system_status(state: AppState) -> Result<warp::reply::WithStatus<warp::reply::Json>, warp::Rejection> {
  let timeout = state.heartbeat_timeout.as_secs_f64();
  Ok(match system_status(state.store.as_ref(), &state.keys, DEFAULT_SAMPLE, timeout).await {
    Ok(status) => warp::reply::with_status(warp::reply::json(&status), StatusCode::OK),
    Err(e) => unavailable(e),
  })
}

fn unavailable(e: crate::error::StoreError) -> warp::reply::WithStatus<warp::reply::Json> {
  error!(error = %e, "Status query failed");
  warp::reply::with_status(
    warp::reply::json(&json!({"error": format!("Queue store unavailable: {e}")})),
    StatusCode::SERVICE_UNAVAILABLE,
  )
}
