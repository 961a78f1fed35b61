use std::convert::Infallible;
use std::time::Duration;

use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tracing::warn;
use warp::Filter;

use super::{AppState, with_state};
use crate::status::{DEFAULT_SAMPLE, system_status};

const PUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Pushes a fresh system status snapshot every couple of seconds.
pub fn sse_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_state(state))
    .map(handle_sse)
}

fn handle_sse(state: AppState) -> impl warp::Reply {
  let interval = IntervalStream::new(tokio::time::interval(PUSH_INTERVAL));
  let stream = interval
    .then(move |_| {
      let state = state.clone();
      async move {
        let timeout = state.heartbeat_timeout.as_secs_f64();
        match system_status(state.store.as_ref(), &state.keys, DEFAULT_SAMPLE, timeout).await {
          Ok(status) => warp::sse::Event::default().event("status").json_data(&status).ok(),
          Err(e) => {
            warn!(error = %e, "Error fetching system status");
            None
          }
        }
      }
    })
    .filter_map(|event| event.map(Ok::<_, Infallible>));

  warp::sse::reply(warp::sse::keep_alive().stream(stream))
}
