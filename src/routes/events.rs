use serde::Deserialize;
use serde_json::json;
use warp::{Filter, Rejection, Reply};

use super::{AppState, reject, task_key, with_state};
use crate::error::TaskError;
use crate::events::{DEFAULT_EVENT_LIMIT, MAX_EVENT_LIMIT, timeline};

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
  pub limit: Option<i64>,
}

pub fn route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "tasks" / String / "events")
    .and(warp::get())
    .and(warp::query::<EventsQuery>())
    .and(with_state(state))
    .and_then(handle_events)
}

async fn handle_events(company: String, task_id: String, query: EventsQuery, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
  if !(1..=MAX_EVENT_LIMIT).contains(&limit) {
    return Err(reject(TaskError::Validation(format!("limit must be between 1 and {MAX_EVENT_LIMIT}"))));
  }
  let events = timeline(&state.store, &key, limit).await.map_err(reject)?;
  Ok(warp::reply::json(&json!({ "items": events })))
}
