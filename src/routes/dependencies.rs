use serde::Deserialize;
use serde_json::{Value, json};
use warp::{Filter, Rejection, Reply};

use super::{AppState, json_body, reject, task_key, with_state};
use crate::dependencies::parse_dependee_ids;
use crate::models::DependencyView;

#[derive(Debug, Deserialize)]
pub struct AddDependenciesIn {
  pub dependee_task_ids: Vec<String>,
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  add_route(state.clone()).or(list_route(state.clone())).or(dependents_route(state))
}

fn add_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "tasks" / String / "dependencies")
    .and(warp::post())
    .and(json_body::<AddDependenciesIn>())
    .and(with_state(state))
    .and_then(handle_add)
}

fn list_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "tasks" / String / "dependencies")
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_list)
}

fn dependents_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "tasks" / String / "dependents")
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_dependents)
}

async fn handle_add(company: String, task_id: String, body: AddDependenciesIn, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let dependees = parse_dependee_ids(&body.dependee_task_ids).map_err(reject)?;
  state.graph.add(&key, &dependees).await.map_err(reject)?;
  Ok(warp::reply::json(&json!({
    "ok": true,
    "waiter_task_id": key.task_id,
    "dependee_task_ids": dependees,
  })))
}

fn item(view: DependencyView, id_field: &str) -> Value {
  json!({
    id_field: view.task_id,
    "title": view.title,
    "status": view.status,
    "runtime": view.runtime,
    "control": view.control,
  })
}

async fn handle_list(company: String, task_id: String, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let views = state.graph.dependencies(&key).await.map_err(reject)?;
  let items: Vec<Value> = views.into_iter().map(|v| item(v, "dependee_task_id")).collect();
  Ok(warp::reply::json(&json!({ "items": items })))
}

async fn handle_dependents(company: String, task_id: String, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let views = state.graph.dependents(&key).await.map_err(reject)?;
  let items: Vec<Value> = views.into_iter().map(|v| item(v, "waiter_task_id")).collect();
  Ok(warp::reply::json(&json!({ "items": items })))
}
