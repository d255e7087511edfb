use chrono::Utc;
use serde_json::json;
use warp::hyper::body::Bytes;
use warp::{Filter, Rejection, Reply};

use super::{AppState, MAX_BODY_BYTES, reject, task_key, with_state};
use crate::callback::{SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// Raw bytes are kept so the signature is checked over exactly what was sent.
pub fn route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "tasks" / String / "callback")
    .and(warp::post())
    .and(warp::header::optional::<String>(TIMESTAMP_HEADER))
    .and(warp::header::optional::<String>(SIGNATURE_HEADER))
    .and(warp::body::content_length_limit(MAX_BODY_BYTES))
    .and(warp::body::bytes())
    .and(with_state(state))
    .and_then(handle_callback)
}

async fn handle_callback(
  company: String,
  task_id: String,
  timestamp: Option<String>,
  signature: Option<String>,
  body: Bytes,
  state: AppState,
) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let task = state
    .callbacks
    .handle(&key, timestamp.as_deref(), signature.as_deref(), &body, Utc::now())
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&json!({ "ok": true, "task_id": task.id, "status": task.status })))
}
