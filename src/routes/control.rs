use serde_json::json;
use warp::{Filter, Rejection, Reply};

use super::{AppState, reject, task_key, with_state};
use crate::control::ControlOp;

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  op_route(state.clone(), "pause", ControlOp::Pause)
    .or(op_route(state.clone(), "resume", ControlOp::Resume))
    .or(op_route(state.clone(), "cancel", ControlOp::Cancel))
    .or(op_route(state, "reset", ControlOp::Reset))
}

fn op_route(state: AppState, name: &'static str, op: ControlOp) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("companies")
    .and(warp::path::param::<String>())
    .and(warp::path("tasks"))
    .and(warp::path::param::<String>())
    .and(warp::path(name))
    .and(warp::path::end())
    .and(warp::post())
    .and(with_state(state))
    .and_then(move |company: String, task_id: String, state: AppState| handle_control(company, task_id, op, state))
}

async fn handle_control(company: String, task_id: String, op: ControlOp, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let control = state.control.apply(&key, op).await.map_err(reject)?;
  Ok(warp::reply::json(&json!({ "id": key.task_id, "control": control })))
}
