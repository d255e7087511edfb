//! Append-only task timeline.
//!
//! Events are written in the same transaction as the state change they
//! describe and are never updated afterwards. The state machine never reads
//! them back; they exist for audit and UI timelines.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::TaskError;
use crate::models::TaskKey;
use crate::store::TaskStore;

pub const DEFAULT_EVENT_LIMIT: i64 = 200;
pub const MAX_EVENT_LIMIT: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
  System,
  Integration,
  User,
}

impl ActorType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::System => "system",
      Self::Integration => "integration",
      Self::User => "user",
    }
  }
}

impl FromStr for ActorType {
  type Err = TaskError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "system" => Ok(Self::System),
      "integration" => Ok(Self::Integration),
      "user" => Ok(Self::User),
      other => Err(TaskError::Internal(format!("unknown actor type '{other}'"))),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  TaskCreated,
  RunRequested,
  RetryRequested,
  DispatchReserved,
  RunEnqueued,
  RetryEnqueued,
  DispatchEnqueued,
  RunEnqueueFailed,
  RetryEnqueueFailed,
  DispatchFailed,
  Pause,
  Resume,
  Cancel,
  Reset,
  WorkerStarted,
  TaskPaused,
  TaskResumed,
  TaskCanceled,
  TaskBlocked,
  TaskDone,
  TaskFailed,
  CallbackReceived,
  DependenciesAdded,
}

impl EventKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::TaskCreated => "task_created",
      Self::RunRequested => "run_requested",
      Self::RetryRequested => "retry_requested",
      Self::DispatchReserved => "dispatch_reserved",
      Self::RunEnqueued => "run_enqueued",
      Self::RetryEnqueued => "retry_enqueued",
      Self::DispatchEnqueued => "dispatch_enqueued",
      Self::RunEnqueueFailed => "run_enqueue_failed",
      Self::RetryEnqueueFailed => "retry_enqueue_failed",
      Self::DispatchFailed => "dispatch_failed",
      Self::Pause => "pause",
      Self::Resume => "resume",
      Self::Cancel => "cancel",
      Self::Reset => "reset",
      Self::WorkerStarted => "worker_started",
      Self::TaskPaused => "task_paused",
      Self::TaskResumed => "task_resumed",
      Self::TaskCanceled => "task_canceled",
      Self::TaskBlocked => "task_blocked",
      Self::TaskDone => "task_done",
      Self::TaskFailed => "task_failed",
      Self::CallbackReceived => "callback_received",
      Self::DependenciesAdded => "dependencies_added",
    }
  }
}

impl fmt::Display for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An event waiting to be appended together with its state change.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
  pub kind: EventKind,
  pub actor: ActorType,
  pub payload: Value,
  pub at: DateTime<Utc>,
}

impl NewEvent {
  pub fn new(kind: EventKind, actor: ActorType, at: DateTime<Utc>, payload: Value) -> Self {
    let mut payload = match payload {
      Value::Object(map) => Value::Object(map),
      Value::Null => json!({}),
      other => json!({ "value": other }),
    };
    if let Value::Object(map) = &mut payload {
      map.entry("ts").or_insert_with(|| json!(at.to_rfc3339()));
    }
    Self { kind, actor, payload, at }
  }

  pub fn system(kind: EventKind, at: DateTime<Utc>, payload: Value) -> Self {
    Self::new(kind, ActorType::System, at, payload)
  }

  pub fn user(kind: EventKind, at: DateTime<Utc>, payload: Value) -> Self {
    Self::new(kind, ActorType::User, at, payload)
  }

  pub fn integration(kind: EventKind, at: DateTime<Utc>, payload: Value) -> Self {
    Self::new(kind, ActorType::Integration, at, payload)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
  pub id: i64,
  pub task_id: Uuid,
  pub company_id: Uuid,
  pub event_type: String,
  pub actor_type: ActorType,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
}

/// Ordered timeline for a task. An empty list is only returned for a task that exists.
pub async fn timeline(store: &Arc<dyn TaskStore>, key: &TaskKey, limit: i64) -> Result<Vec<TaskEvent>, TaskError> {
  let limit = limit.clamp(1, MAX_EVENT_LIMIT);
  let events = store.list_events(key, limit).await?;
  if events.is_empty() && store.get_task(key).await?.is_none() {
    return Err(TaskError::NotFound("task"));
  }
  Ok(events)
}
