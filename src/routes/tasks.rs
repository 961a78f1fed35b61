use serde_json::json;
use tracing::{error, warn};
use warp::Filter;
use warp::http::StatusCode;

use super::{AppState, with_state};
use crate::models::SubmitRequest;
use crate::worker_scheduler::Assignment;

pub fn submit_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("submit_task")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::content_length_limit(1024 * 1024))
    .and(warp::body::bytes())
    .and(with_state(state))
    .and_then(handle_submit_task)
}

async fn handle_submit_task(body: warp::hyper::body::Bytes, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let request = match serde_json::from_slice::<SubmitRequest>(&body) {
    Ok(request) => request,
    Err(e) => {
      warn!(error = %e, "Rejected malformed submission body");
      return Ok(reply(StatusCode::BAD_REQUEST, json!({"error": format!("Invalid JSON body: {e}")})));
    }
  };
  let task = match request.into_task() {
    Ok(task) => task,
    Err(e) => {
      warn!(error = %e, "Payload validation failed");
      return Ok(reply(StatusCode::BAD_REQUEST, json!({"error": e.to_string()})));
    }
  };

  let task_id = task.id.clone();
  match state.scheduler.assign(task).await {
    Assignment::Worker(worker_id) => Ok(reply(
      StatusCode::OK,
      json!({"message": format!("Task {task_id} submitted successfully!"), "assigned_to": worker_id}),
    )),
    Assignment::Pending => Ok(reply(
      StatusCode::OK,
      json!({"message": format!("Task {task_id} submitted successfully!"), "assigned_to": null}),
    )),
    Assignment::Lost => {
      error!(task_id = %task_id, "Task could not be stored");
      Ok(reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": format!("Server error: task {task_id} could not be stored")}),
      ))
    }
  }
}

fn reply(status: StatusCode, body: serde_json::Value) -> warp::reply::WithStatus<warp::reply::Json> {
  warp::reply::with_status(warp::reply::json(&body), status)
}
