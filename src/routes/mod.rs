use std::convert::Infallible;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tracing::error;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::callback::CallbackVerifier;
use crate::config::ApiSettings;
use crate::control::ControlPlane;
use crate::dependencies::DependencyGraph;
use crate::dispatcher::Dispatcher;
use crate::error::TaskError;
use crate::messaging::Broker;
use crate::models::TaskKey;
use crate::store::TaskStore;

pub mod callback;
pub mod control;
pub mod dependencies;
pub mod events;
pub mod sse;
pub mod tasks;

/// Request bodies above this size are refused.
const MAX_BODY_BYTES: u64 = 1024 * 1024;

static CODE_PATTERN: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("code pattern compiles"));

/// Everything a handler needs, cloned into each filter.
#[derive(Clone)]
pub struct AppState {
  pub store: Arc<dyn TaskStore>,
  pub dispatcher: Dispatcher,
  pub control: ControlPlane,
  pub callbacks: CallbackVerifier,
  pub graph: DependencyGraph,
  pub stream_poll: Duration,
}

impl AppState {
  pub fn new(store: Arc<dyn TaskStore>, broker: Arc<dyn Broker>, settings: &ApiSettings) -> Self {
    Self {
      dispatcher: Dispatcher::new(store.clone(), broker),
      control: ControlPlane::new(store.clone()),
      callbacks: CallbackVerifier::new(store.clone(), settings.callback_tolerance_secs),
      graph: DependencyGraph::new(store.clone()),
      stream_poll: settings.stream_poll,
      store,
    }
  }
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  health()
    .or(tasks::routes(state.clone()))
    .or(control::routes(state.clone()))
    .or(callback::route(state.clone()))
    .or(dependencies::routes(state.clone()))
    .or(events::route(state.clone()))
    .or(sse::route(state))
    .recover(handle_rejection)
}

fn health() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("health")
    .and(warp::get())
    .map(|| warp::reply::json(&json!({ "status": "ok" })))
}

pub(crate) fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

pub(crate) fn json_body<T: serde::de::DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
  warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

pub(crate) fn reject(e: TaskError) -> Rejection {
  warp::reject::custom(e)
}

pub fn parse_code(raw: &str, what: &str) -> Result<String, TaskError> {
  if CODE_PATTERN.is_match(raw) {
    Ok(raw.to_string())
  } else {
    Err(TaskError::BadRequest(format!("invalid {what} code")))
  }
}

pub fn parse_task_id(raw: &str) -> Result<Uuid, TaskError> {
  Uuid::parse_str(raw).map_err(|_| TaskError::BadRequest(format!("invalid task id '{raw}'")))
}

pub fn task_key(company: &str, task_id: &str) -> Result<TaskKey, TaskError> {
  Ok(TaskKey::new(parse_code(company, "company")?, parse_task_id(task_id)?))
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, kind, detail) = if let Some(e) = err.find::<TaskError>() {
    if e.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
      error!(error = %e, "request failed");
    }
    (e.status_code(), e.kind(), e.public_detail())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::UNPROCESSABLE_ENTITY, "validation", e.to_string())
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    (StatusCode::PAYLOAD_TOO_LARGE, "bad_request", "payload too large".to_string())
  } else if err.find::<warp::reject::LengthRequired>().is_some() {
    (StatusCode::LENGTH_REQUIRED, "bad_request", "content-length required".to_string())
  } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "bad_request", "expected application/json".to_string())
  } else if err.find::<warp::reject::InvalidQuery>().is_some() {
    (StatusCode::BAD_REQUEST, "bad_request", "invalid query string".to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not_found", "route not found".to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "method not allowed".to_string())
  } else {
    error!(rejection = ?err, "unhandled rejection");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal server error".to_string())
  };

  Ok(warp::reply::with_status(
    warp::reply::json(&json!({ "error": kind, "detail": detail })),
    status,
  ))
}
