use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

use crate::error::TaskError;
use crate::events::{NewEvent, TaskEvent};
use crate::models::{
  ControlFlags, DependencyView, Integration, IntegrationConfig, IntegrationSecret, JobState, NewTask, Page, Runtime,
  Task, TaskKey, TaskStatus,
};
use crate::state_machine::reserve_for_dispatch;
use crate::store::{Mutation, TaskStore, join_ids, missing_ids};

const TASK_SELECT: &str = "SELECT t.id, t.company_id, c.code AS company_code, t.project_id, p.code AS project_code, \
  t.integration_id, t.title, t.status, t.priority, t.attempt_count, t.max_attempts, t.control, t.runtime, \
  t.last_error, t.deadline_at, t.last_heartbeat_at, t.created_at, t.updated_at \
  FROM tasks t \
  JOIN companies c ON c.id = t.company_id \
  LEFT JOIN projects p ON p.id = t.project_id";

#[derive(FromRow)]
struct TaskRow {
  id: Uuid,
  company_id: Uuid,
  company_code: String,
  project_id: Option<Uuid>,
  project_code: Option<String>,
  integration_id: Option<Uuid>,
  title: String,
  status: String,
  priority: String,
  attempt_count: i32,
  max_attempts: i32,
  control: Json<ControlFlags>,
  runtime: Json<Runtime>,
  last_error: Option<String>,
  deadline_at: Option<DateTime<Utc>>,
  last_heartbeat_at: Option<DateTime<Utc>>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
  type Error = TaskError;

  fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
    Ok(Task {
      id: row.id,
      company_id: row.company_id,
      company_code: row.company_code,
      project_id: row.project_id,
      project_code: row.project_code,
      integration_id: row.integration_id,
      title: row.title,
      status: row.status.parse()?,
      priority: row.priority.parse()?,
      attempt_count: row.attempt_count,
      max_attempts: row.max_attempts,
      control: row.control.0,
      runtime: row.runtime.0,
      last_error: row.last_error,
      deadline_at: row.deadline_at,
      last_heartbeat_at: row.last_heartbeat_at,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

#[derive(FromRow)]
struct EventRow {
  id: i64,
  task_id: Uuid,
  company_id: Uuid,
  event_type: String,
  actor_type: String,
  payload: Value,
  created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct DependencyRow {
  task_id: Uuid,
  title: String,
  status: String,
  runtime: Json<Runtime>,
  control: Json<ControlFlags>,
  created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct IntegrationRow {
  id: Uuid,
  company_id: Uuid,
  provider_code: String,
  is_active: bool,
  config: Json<IntegrationConfig>,
  secret: Json<IntegrationSecret>,
}

#[derive(FromRow)]
struct JobRow {
  handle: String,
  task_id: Uuid,
  state: String,
  result: Option<Value>,
  error: Option<String>,
  updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PgTaskStore {
  pool: Pool<Postgres>,
}

impl PgTaskStore {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }

  async fn dependency_views(&self, sql: &str, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError> {
    let rows = sqlx::query_as::<_, DependencyRow>(sql)
      .bind(&key.company_code)
      .bind(key.task_id)
      .fetch_all(&self.pool)
      .await?;
    rows
      .into_iter()
      .map(|row| {
        Ok(DependencyView {
          task_id: row.task_id,
          title: row.title,
          status: row.status.parse()?,
          runtime: row.runtime.0,
          control: row.control.0,
          created_at: row.created_at,
        })
      })
      .collect()
  }
}

async fn lock_task(conn: &mut PgConnection, key: &TaskKey) -> Result<Option<Task>, TaskError> {
  let row = sqlx::query_as::<_, TaskRow>(&format!("{TASK_SELECT} WHERE c.code = $1 AND t.id = $2 FOR UPDATE OF t"))
    .bind(&key.company_code)
    .bind(key.task_id)
    .fetch_optional(conn)
    .await?;
  row.map(Task::try_from).transpose()
}

async fn write_task(conn: &mut PgConnection, task: &Task) -> Result<(), TaskError> {
  sqlx::query(
    "UPDATE tasks SET status = $1, attempt_count = $2, control = $3, runtime = $4, last_error = $5, \
     last_heartbeat_at = $6, updated_at = $7 WHERE id = $8",
  )
  .bind(task.status.as_str())
  .bind(task.attempt_count)
  .bind(Json(task.control))
  .bind(Json(task.runtime.clone()))
  .bind(&task.last_error)
  .bind(task.last_heartbeat_at)
  .bind(task.updated_at)
  .bind(task.id)
  .execute(conn)
  .await?;
  Ok(())
}

async fn insert_events(conn: &mut PgConnection, task_id: Uuid, company_id: Uuid, events: &[NewEvent]) -> Result<(), TaskError> {
  for event in events {
    sqlx::query(
      "INSERT INTO task_events (task_id, company_id, event_type, actor_type, payload, created_at) \
       VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(task_id)
    .bind(company_id)
    .bind(event.kind.as_str())
    .bind(event.actor.as_str())
    .bind(&event.payload)
    .bind(event.at)
    .execute(&mut *conn)
    .await?;
  }
  Ok(())
}

#[async_trait]
impl TaskStore for PgTaskStore {
  async fn company_id(&self, company_code: &str) -> Result<Option<Uuid>, TaskError> {
    let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM companies WHERE code = $1")
      .bind(company_code)
      .fetch_optional(&self.pool)
      .await?;
    Ok(id)
  }

  async fn project_id(&self, company_id: Uuid, project_code: &str) -> Result<Option<Uuid>, TaskError> {
    let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM projects WHERE company_id = $1 AND code = $2")
      .bind(company_id)
      .bind(project_code)
      .fetch_optional(&self.pool)
      .await?;
    Ok(id)
  }

  async fn integration(&self, company_id: Uuid, integration_id: Uuid) -> Result<Option<Integration>, TaskError> {
    let row = sqlx::query_as::<_, IntegrationRow>(
      "SELECT id, company_id, provider_code, is_active, config, secret FROM integrations WHERE company_id = $1 AND id = $2",
    )
    .bind(company_id)
    .bind(integration_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.map(|row| Integration {
      id: row.id,
      company_id: row.company_id,
      provider_code: row.provider_code,
      is_active: row.is_active,
      config: row.config.0,
      secret: row.secret.0,
    }))
  }

  async fn create_task(&self, new: NewTask, created: NewEvent) -> Result<Task, TaskError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      "INSERT INTO tasks (id, company_id, project_id, integration_id, title, status, priority, attempt_count, \
       max_attempts, control, runtime, deadline_at, created_at, updated_at) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9, $10, $11, $12, $12)",
    )
    .bind(id)
    .bind(new.company_id)
    .bind(new.project_id)
    .bind(new.integration_id)
    .bind(&new.title)
    .bind(TaskStatus::Queued.as_str())
    .bind(new.priority.as_str())
    .bind(new.max_attempts)
    .bind(Json(ControlFlags::default()))
    .bind(Json(Runtime::with_job(new.job)))
    .bind(new.deadline_at)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    insert_events(&mut tx, id, new.company_id, &[created]).await?;

    let row = sqlx::query_as::<_, TaskRow>(&format!("{TASK_SELECT} WHERE t.id = $1"))
      .bind(id)
      .fetch_one(&mut *tx)
      .await?;
    tx.commit().await?;
    Task::try_from(row)
  }

  async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>, TaskError> {
    let row = sqlx::query_as::<_, TaskRow>(&format!("{TASK_SELECT} WHERE c.code = $1 AND t.id = $2"))
      .bind(&key.company_code)
      .bind(key.task_id)
      .fetch_optional(&self.pool)
      .await?;
    row.map(Task::try_from).transpose()
  }

  async fn list_tasks(&self, company_id: Uuid, project_id: Uuid, page: Page) -> Result<Vec<Task>, TaskError> {
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
      "{TASK_SELECT} WHERE t.company_id = $1 AND t.project_id = $2 ORDER BY t.created_at DESC LIMIT $3 OFFSET $4"
    ))
    .bind(company_id)
    .bind(project_id)
    .bind(page.limit)
    .bind(page.offset)
    .fetch_all(&self.pool)
    .await?;
    rows.into_iter().map(Task::try_from).collect()
  }

  async fn mutate_task(&self, key: &TaskKey, mutation: Mutation) -> Result<Task, TaskError> {
    // Dropping `tx` on any early return rolls it back.
    let mut tx = self.pool.begin().await?;
    let mut task = lock_task(&mut tx, key).await?.ok_or(TaskError::NotFound("task"))?;
    let events = mutation(&mut task)?;
    task.updated_at = Utc::now();
    write_task(&mut tx, &task).await?;
    insert_events(&mut tx, task.id, task.company_id, &events).await?;
    tx.commit().await?;
    Ok(task)
  }

  async fn reserve_dispatchable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError> {
    let mut tx = self.pool.begin().await?;
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
      "{TASK_SELECT} WHERE t.status = 'queued' \
       AND t.runtime->'job' IS NOT NULL \
       AND t.runtime->>'broker_handle' IS NULL \
       AND COALESCE((t.control->>'pause')::boolean, false) = false \
       AND COALESCE((t.control->>'cancel')::boolean, false) = false \
       AND t.attempt_count < t.max_attempts \
       ORDER BY t.created_at ASC LIMIT $1 FOR UPDATE OF t SKIP LOCKED"
    ))
    .bind(limit as i64)
    .fetch_all(&mut *tx)
    .await?;

    let mut reserved = Vec::with_capacity(rows.len());
    for row in rows {
      let mut task = Task::try_from(row)?;
      let events = reserve_for_dispatch(&mut task, now)?;
      task.updated_at = now;
      write_task(&mut tx, &task).await?;
      insert_events(&mut tx, task.id, task.company_id, &events).await?;
      reserved.push(task);
    }
    tx.commit().await?;
    debug!(count = reserved.len(), "reserved dispatch candidates");
    Ok(reserved)
  }

  async fn read_control(&self, key: &TaskKey) -> Result<Option<ControlFlags>, TaskError> {
    let control = sqlx::query_scalar::<_, Json<ControlFlags>>(
      "SELECT t.control FROM tasks t JOIN companies c ON c.id = t.company_id WHERE c.code = $1 AND t.id = $2",
    )
    .bind(&key.company_code)
    .bind(key.task_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(control.map(|c| c.0))
  }

  async fn add_dependencies(&self, waiter: &TaskKey, dependees: &[Uuid], event: NewEvent) -> Result<u64, TaskError> {
    let mut tx = self.pool.begin().await?;
    let task = lock_task(&mut tx, waiter).await?.ok_or(TaskError::NotFound("task"))?;

    let found = sqlx::query_scalar::<_, Uuid>("SELECT id FROM tasks WHERE company_id = $1 AND id = ANY($2)")
      .bind(task.company_id)
      .bind(dependees)
      .fetch_all(&mut *tx)
      .await?;
    let missing = missing_ids(dependees, &found);
    if !missing.is_empty() {
      return Err(TaskError::conflict(format!("unknown dependee tasks: {}", join_ids(&missing))));
    }

    let inserted = sqlx::query(
      "INSERT INTO task_dependencies (waiter_task_id, dependee_task_id) \
       SELECT $1, UNNEST($2::uuid[]) ON CONFLICT DO NOTHING",
    )
    .bind(task.id)
    .bind(dependees)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    insert_events(&mut tx, task.id, task.company_id, &[event]).await?;
    tx.commit().await?;
    Ok(inserted)
  }

  async fn list_dependencies(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError> {
    self
      .dependency_views(
        "SELECT t.id AS task_id, t.title, t.status, t.runtime, t.control, t.created_at \
         FROM task_dependencies d \
         JOIN tasks t ON t.id = d.dependee_task_id \
         JOIN tasks w ON w.id = d.waiter_task_id \
         JOIN companies c ON c.id = w.company_id \
         WHERE c.code = $1 AND d.waiter_task_id = $2 ORDER BY t.created_at ASC",
        key,
      )
      .await
  }

  async fn list_dependents(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError> {
    self
      .dependency_views(
        "SELECT t.id AS task_id, t.title, t.status, t.runtime, t.control, t.created_at \
         FROM task_dependencies d \
         JOIN tasks t ON t.id = d.waiter_task_id \
         JOIN tasks e ON e.id = d.dependee_task_id \
         JOIN companies c ON c.id = e.company_id \
         WHERE c.code = $1 AND d.dependee_task_id = $2 ORDER BY t.created_at ASC",
        key,
      )
      .await
  }

  async fn list_events(&self, key: &TaskKey, limit: i64) -> Result<Vec<TaskEvent>, TaskError> {
    let rows = sqlx::query_as::<_, EventRow>(
      "SELECT e.id, e.task_id, e.company_id, e.event_type, e.actor_type, e.payload, e.created_at \
       FROM task_events e JOIN companies c ON c.id = e.company_id \
       WHERE c.code = $1 AND e.task_id = $2 ORDER BY e.id ASC LIMIT $3",
    )
    .bind(&key.company_code)
    .bind(key.task_id)
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;
    rows
      .into_iter()
      .map(|row| {
        Ok(TaskEvent {
          id: row.id,
          task_id: row.task_id,
          company_id: row.company_id,
          event_type: row.event_type,
          actor_type: row.actor_type.parse()?,
          payload: row.payload,
          created_at: row.created_at,
        })
      })
      .collect()
  }

  async fn record_job_state(&self, state: &JobState) -> Result<(), TaskError> {
    sqlx::query(
      "INSERT INTO broker_jobs (handle, task_id, state, result, error, updated_at) VALUES ($1, $2, $3, $4, $5, $6) \
       ON CONFLICT (handle) DO UPDATE SET state = EXCLUDED.state, result = EXCLUDED.result, \
       error = EXCLUDED.error, updated_at = EXCLUDED.updated_at",
    )
    .bind(&state.handle)
    .bind(state.task_id)
    .bind(state.state.as_str())
    .bind(state.result.clone())
    .bind(&state.error)
    .bind(state.updated_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn job_state(&self, handle: &str) -> Result<Option<JobState>, TaskError> {
    let row = sqlx::query_as::<_, JobRow>(
      "SELECT handle, task_id, state, result, error, updated_at FROM broker_jobs WHERE handle = $1",
    )
    .bind(handle)
    .fetch_optional(&self.pool)
    .await?;
    row
      .map(|row| {
        Ok(JobState {
          handle: row.handle,
          task_id: row.task_id,
          state: row.state.parse()?,
          result: row.result,
          error: row.error,
          updated_at: row.updated_at,
        })
      })
      .transpose()
  }
}
