use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{AppState, json_body, parse_code, reject, task_key, with_state};
use crate::dispatcher::RunReceipt;
use crate::error::TaskError;
use crate::events::{EventKind, NewEvent};
use crate::models::{JobSpec, NewTask, Page, Priority, TaskStatus};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;
pub const MAX_PAGE_OFFSET: i64 = 100_000;
pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_ATTEMPTS_LIMIT: i32 = 50;

fn default_max_attempts() -> i32 {
  5
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskIn {
  pub title: String,
  #[serde(default = "default_max_attempts")]
  pub max_attempts: i32,
  #[serde(default)]
  pub priority: Priority,
  #[serde(default)]
  pub deadline_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub job_type: Option<String>,
  #[serde(default)]
  pub payload: Option<Value>,
  #[serde(default)]
  pub integration_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
  pub limit: Option<i64>,
  pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RunIn {
  pub job_type: String,
  #[serde(default)]
  pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct TaskSnapshot {
  pub task_id: Uuid,
  pub status: TaskStatus,
  pub attempt_count: i32,
  pub max_attempts: i32,
  pub project_code: Option<String>,
  pub previous_broker_handle: Option<String>,
  pub last_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct JobSnapshot {
  pub broker_handle: String,
  pub broker_task_name: String,
}

#[derive(Debug, Serialize)]
pub struct RunOut {
  pub company_code: String,
  pub project_code: String,
  pub task: TaskSnapshot,
  pub job: JobSnapshot,
}

impl RunOut {
  fn from_receipt(project_code: String, receipt: RunReceipt) -> Self {
    let task = receipt.task;
    Self {
      company_code: task.company_code.clone(),
      project_code,
      task: TaskSnapshot {
        task_id: task.id,
        status: task.status,
        attempt_count: task.attempt_count,
        max_attempts: task.max_attempts,
        project_code: task.project_code,
        previous_broker_handle: task.runtime.previous_broker_handle,
        last_retry_at: task.runtime.last_retry_at,
      },
      job: JobSnapshot {
        broker_handle: receipt.broker_handle,
        broker_task_name: receipt.broker_task_name,
      },
    }
  }
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  create_route(state.clone())
    .or(list_route(state.clone()))
    .or(run_route(state.clone()))
    .or(retry_route(state.clone()))
    .or(get_route(state.clone()))
    .or(status_route(state))
}

fn create_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "projects" / String / "tasks")
    .and(warp::post())
    .and(json_body::<CreateTaskIn>())
    .and(with_state(state))
    .and_then(handle_create)
}

fn list_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "projects" / String / "tasks")
    .and(warp::get())
    .and(warp::query::<ListQuery>())
    .and(with_state(state))
    .and_then(handle_list)
}

fn run_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "projects" / String / "tasks" / String / "run")
    .and(warp::get().or(warp::post()).unify())
    .and(run_body())
    .and(with_state(state))
    .and_then(handle_run)
}

/// A bare `GET .../run` carries no Content-Length; report the missing job instead of 411.
fn run_body() -> impl Filter<Extract = (RunIn,), Error = Rejection> + Clone {
  let missing = warp::header::optional::<u64>("content-length").and_then(|length: Option<u64>| async move {
    let rejection = match length {
      None | Some(0) => reject(TaskError::Validation("run needs a JSON body with job_type and payload".into())),
      Some(_) => warp::reject::not_found(),
    };
    Err::<RunIn, Rejection>(rejection)
  });
  json_body::<RunIn>().or(missing).unify()
}

fn retry_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "projects" / String / "tasks" / String / "retry")
    .and(warp::post())
    .and(with_state(state))
    .and_then(handle_retry)
}

fn get_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "tasks" / String)
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_get)
}

fn status_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "tasks" / String / "status")
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_status)
}

fn validate_create(body: &CreateTaskIn) -> Result<Option<JobSpec>, TaskError> {
  let title_len = body.title.trim().chars().count();
  if title_len == 0 || title_len > MAX_TITLE_CHARS {
    return Err(TaskError::Validation(format!("title must be 1-{MAX_TITLE_CHARS} characters")));
  }
  if !(1..=MAX_ATTEMPTS_LIMIT).contains(&body.max_attempts) {
    return Err(TaskError::Validation(format!("max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}")));
  }
  let job = match (&body.job_type, &body.payload) {
    (Some(job_type), payload) => Some(JobSpec::from_parts(job_type, payload.clone().unwrap_or(Value::Null))?),
    (None, Some(_)) => return Err(TaskError::Validation("payload requires job_type".into())),
    (None, None) => None,
  };
  if job.as_ref().is_some_and(JobSpec::is_webhook_class) && body.integration_id.is_none() {
    return Err(TaskError::Validation("integration_id is required for webhook jobs".into()));
  }
  Ok(job)
}

async fn handle_create(company: String, project: String, body: CreateTaskIn, state: AppState) -> Result<impl Reply, Rejection> {
  let company = parse_code(&company, "company").map_err(reject)?;
  let project = parse_code(&project, "project").map_err(reject)?;
  let job = validate_create(&body).map_err(reject)?;

  let company_id = state
    .store
    .company_id(&company)
    .await
    .map_err(reject)?
    .ok_or_else(|| reject(TaskError::NotFound("company")))?;
  // An unknown project leaves the task scoped to the tenant only.
  let project_id = state.store.project_id(company_id, &project).await.map_err(reject)?;
  if let Some(integration_id) = body.integration_id {
    state
      .store
      .integration(company_id, integration_id)
      .await
      .map_err(reject)?
      .ok_or_else(|| reject(TaskError::NotFound("integration")))?;
  }

  let created = NewEvent::user(
    EventKind::TaskCreated,
    Utc::now(),
    json!({
      "title": body.title.trim(),
      "priority": body.priority,
      "job_type": job.as_ref().map(JobSpec::job_type),
    }),
  );
  let task = state
    .store
    .create_task(
      NewTask {
        company_id,
        project_id,
        integration_id: body.integration_id,
        title: body.title.trim().to_string(),
        priority: body.priority,
        max_attempts: body.max_attempts,
        deadline_at: body.deadline_at,
        job,
      },
      created,
    )
    .await
    .map_err(reject)?;

  info!(task_id = %task.id, company = %company, "task created");
  Ok(warp::reply::with_status(warp::reply::json(&task), StatusCode::CREATED))
}

fn page_from(query: &ListQuery) -> Result<Page, TaskError> {
  let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
  let offset = query.offset.unwrap_or(0);
  if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
    return Err(TaskError::Validation(format!("limit must be between 1 and {MAX_PAGE_LIMIT}")));
  }
  if !(0..=MAX_PAGE_OFFSET).contains(&offset) {
    return Err(TaskError::Validation(format!("offset must be between 0 and {MAX_PAGE_OFFSET}")));
  }
  Ok(Page { limit, offset })
}

async fn handle_list(company: String, project: String, query: ListQuery, state: AppState) -> Result<impl Reply, Rejection> {
  let company = parse_code(&company, "company").map_err(reject)?;
  let project = parse_code(&project, "project").map_err(reject)?;
  let page = page_from(&query).map_err(reject)?;

  let company_id = state
    .store
    .company_id(&company)
    .await
    .map_err(reject)?
    .ok_or_else(|| reject(TaskError::NotFound("company")))?;
  let project_id = state
    .store
    .project_id(company_id, &project)
    .await
    .map_err(reject)?
    .ok_or_else(|| reject(TaskError::NotFound("project")))?;

  let items = state.store.list_tasks(company_id, project_id, page).await.map_err(reject)?;
  Ok(warp::reply::json(&json!({ "items": items, "limit": page.limit, "offset": page.offset })))
}

async fn handle_run(company: String, project: String, task_id: String, body: RunIn, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let project = parse_code(&project, "project").map_err(reject)?;
  let job = JobSpec::from_parts(&body.job_type, body.payload).map_err(reject)?;

  let receipt = state.dispatcher.run(&key, Some(&project), job).await.map_err(reject)?;
  Ok(warp::reply::json(&RunOut::from_receipt(project, receipt)))
}

async fn handle_retry(company: String, project: String, task_id: String, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let project = parse_code(&project, "project").map_err(reject)?;

  let receipt = state.dispatcher.retry(&key, Some(&project)).await.map_err(reject)?;
  Ok(warp::reply::json(&RunOut::from_receipt(project, receipt)))
}

async fn handle_get(company: String, task_id: String, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let task = state
    .store
    .get_task(&key)
    .await
    .map_err(reject)?
    .ok_or_else(|| reject(TaskError::NotFound("task")))?;
  Ok(warp::reply::json(&task))
}

/// Store status merged with the result backend's view of the current handle.
async fn handle_status(company: String, task_id: String, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  let task = state
    .store
    .get_task(&key)
    .await
    .map_err(reject)?
    .ok_or_else(|| reject(TaskError::NotFound("task")))?;

  let handle = task.runtime.broker_handle.clone();
  let job = match &handle {
    Some(handle) => match state.store.job_state(handle).await.map_err(reject)? {
      Some(job) => json!({
        "broker_handle": handle,
        "state": job.state,
        "result": job.result,
        "error": job.error,
      }),
      None => json!({ "broker_handle": handle, "state": "PENDING" }),
    },
    None => json!({ "broker_handle": null, "state": null }),
  };

  Ok(warp::reply::json(&json!({
    "company_code": task.company_code,
    "task_id": task.id,
    "task": {
      "id": task.id,
      "title": task.title,
      "status": task.status,
      "priority": task.priority,
      "attempt_count": task.attempt_count,
      "max_attempts": task.max_attempts,
      "last_error": task.last_error,
      "deadline_at": task.deadline_at,
      "last_heartbeat_at": task.last_heartbeat_at,
      "runtime": task.runtime,
      "control": task.control,
    },
    "job": job,
  })))
}
