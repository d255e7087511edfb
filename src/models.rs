use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::TaskError;

/// Broker task name every dispatch is submitted under.
pub const RUN_TASK_NAME: &str = "taskhub.run_task";

pub const MAX_LONG_DEMO_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  Queued,
  /// Dispatch in flight: selected for the broker, handle not yet recorded.
  Reserving,
  Running,
  Paused,
  Blocked,
  Canceled,
  Done,
  Failed,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Queued => "queued",
      Self::Reserving => "reserving",
      Self::Running => "running",
      Self::Paused => "paused",
      Self::Blocked => "blocked",
      Self::Canceled => "canceled",
      Self::Done => "done",
      Self::Failed => "failed",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Done | Self::Failed | Self::Canceled)
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = TaskError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "queued" => Ok(Self::Queued),
      "reserving" => Ok(Self::Reserving),
      "running" => Ok(Self::Running),
      "paused" => Ok(Self::Paused),
      "blocked" => Ok(Self::Blocked),
      "canceled" => Ok(Self::Canceled),
      "done" => Ok(Self::Done),
      "failed" => Ok(Self::Failed),
      other => Err(TaskError::Internal(format!("unknown task status '{other}'"))),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
  Urgent,
}

impl Priority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Low => "low",
      Self::Normal => "normal",
      Self::High => "high",
      Self::Urgent => "urgent",
    }
  }
}

impl FromStr for Priority {
  type Err = TaskError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "low" => Ok(Self::Low),
      "normal" => Ok(Self::Normal),
      "high" => Ok(Self::High),
      "urgent" => Ok(Self::Urgent),
      other => Err(TaskError::Internal(format!("unknown priority '{other}'"))),
    }
  }
}

/// Out-of-band signals a running worker polls between work units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
  #[serde(default)]
  pub pause: bool,
  #[serde(default)]
  pub cancel: bool,
}

impl ControlFlags {
  pub fn set_pause(&mut self) {
    self.pause = true;
  }

  pub fn resume(&mut self) {
    self.pause = false;
    self.cancel = false;
  }

  /// Cancel clears pause so a task is never both paused and cancelled.
  pub fn cancel(&mut self) {
    self.cancel = true;
    self.pause = false;
  }

  pub fn reset(&mut self) {
    self.pause = false;
    self.cancel = false;
  }

  pub fn is_clear(&self) -> bool {
    !self.pause && !self.cancel
  }
}

fn default_demo_seconds() -> u64 {
  60
}

fn empty_object() -> Value {
  Value::Object(Map::new())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LongDemoJob {
  #[serde(default = "default_demo_seconds")]
  pub seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoJob {
  #[serde(default)]
  pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookJob {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  #[serde(default = "empty_object")]
  pub body: Value,
}

/// What a dispatched task executes. Serialized as
/// `{"job_type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", content = "payload", rename_all = "snake_case")]
pub enum JobSpec {
  LongDemo(LongDemoJob),
  Echo(EchoJob),
  Webhook(WebhookJob),
}

impl JobSpec {
  pub fn from_parts(job_type: &str, payload: Value) -> Result<Self, TaskError> {
    let payload = if payload.is_null() { empty_object() } else { payload };
    let spec: JobSpec = serde_json::from_value(json!({ "job_type": job_type, "payload": payload }))
      .map_err(|e| TaskError::Validation(format!("invalid job specification for '{job_type}': {e}")))?;
    spec.validate()?;
    Ok(spec)
  }

  fn validate(&self) -> Result<(), TaskError> {
    match self {
      JobSpec::LongDemo(job) if job.seconds > MAX_LONG_DEMO_SECONDS => Err(TaskError::Validation(
        format!("long_demo seconds must be at most {MAX_LONG_DEMO_SECONDS}"),
      )),
      JobSpec::Webhook(job) => match (&job.url, &job.path) {
        (Some(_), None) | (None, Some(_)) => Ok(()),
        _ => Err(TaskError::Validation("webhook payload needs exactly one of 'url' or 'path'".into())),
      },
      _ => Ok(()),
    }
  }

  pub fn job_type(&self) -> &'static str {
    match self {
      JobSpec::LongDemo(_) => "long_demo",
      JobSpec::Echo(_) => "echo",
      JobSpec::Webhook(_) => "webhook",
    }
  }

  pub fn payload(&self) -> Value {
    let value = match self {
      JobSpec::LongDemo(job) => serde_json::to_value(job),
      JobSpec::Echo(job) => serde_json::to_value(job),
      JobSpec::Webhook(job) => serde_json::to_value(job),
    };
    value.unwrap_or_else(|_| empty_object())
  }

  /// Jobs whose completion arrives later through a signed callback.
  pub fn is_webhook_class(&self) -> bool {
    matches!(self, JobSpec::Webhook(_))
  }
}

/// Broker submission recorded alongside the job: task name plus args.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchTarget {
  pub name: String,
  pub args: Vec<String>,
  #[serde(default)]
  pub kwargs: Map<String, Value>,
}

impl DispatchTarget {
  pub fn run_task(company_code: &str, task_id: Uuid) -> Self {
    Self {
      name: RUN_TASK_NAME.to_string(),
      args: vec![company_code.to_string(), task_id.to_string()],
      kwargs: Map::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedInfo {
  pub reason: String,
  pub integration_id: Option<Uuid>,
  pub external_url: String,
  pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
  Done,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRecord {
  pub status: CallbackStatus,
  pub result: Option<Value>,
  pub error: Option<String>,
  pub raw_body: String,
  pub received_at: DateTime<Utc>,
}

/// Job specification plus execution bookkeeping, stored as one JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub job: Option<JobSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dispatch: Option<DispatchTarget>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub broker_handle: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub previous_broker_handle: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_retry_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reserved_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub enqueued_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_last_heartbeat_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_finished_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub blocked: Option<BlockedInfo>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub callback: Option<CallbackRecord>,
}

impl Runtime {
  pub fn with_job(job: Option<JobSpec>) -> Self {
    Self { job, ..Self::default() }
  }

  /// Binds a fresh job for a new run; previous dispatch bookkeeping is dropped.
  pub fn bind_job(&mut self, job: JobSpec, dispatch: DispatchTarget) {
    self.job = Some(job);
    self.dispatch = Some(dispatch);
    self.clear_broker_handle();
    self.last_retry_at = None;
    self.reset_execution();
  }

  pub fn clear_broker_handle(&mut self) {
    self.broker_handle = None;
    self.previous_broker_handle = None;
  }

  /// Records a broker handle; a different handle already present becomes the previous one.
  pub fn set_broker_handle(&mut self, handle: &str) {
    if let Some(old) = self.broker_handle.replace(handle.to_string()) {
      if old != handle {
        self.previous_broker_handle = Some(old);
      }
    }
  }

  /// Moves the current handle aside ahead of a retry.
  pub fn rotate_broker_handle(&mut self) {
    self.previous_broker_handle = self.broker_handle.take();
  }

  pub fn reset_execution(&mut self) {
    self.enqueued_at = None;
    self.worker_started_at = None;
    self.worker_last_heartbeat_at = None;
    self.worker_finished_at = None;
    self.worker_error = None;
    self.blocked = None;
    self.callback = None;
  }

  pub fn mark_started(&mut self, at: DateTime<Utc>) {
    self.worker_started_at.get_or_insert(at);
    self.worker_last_heartbeat_at = Some(at);
  }

  pub fn touch_heartbeat(&mut self, at: DateTime<Utc>) {
    self.worker_last_heartbeat_at = Some(at);
  }

  pub fn mark_finished(&mut self, at: DateTime<Utc>) {
    self.worker_finished_at = Some(at);
    self.worker_last_heartbeat_at = Some(at);
  }

  pub fn block_on(&mut self, info: BlockedInfo) {
    self.blocked = Some(info);
  }

  pub fn record_callback(&mut self, record: CallbackRecord) {
    self.worker_finished_at = Some(record.received_at);
    self.callback = Some(record);
  }
}

/// Addresses a task the way every tenant-scoped operation does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
  pub company_code: String,
  pub task_id: Uuid,
}

impl TaskKey {
  pub fn new(company_code: impl Into<String>, task_id: Uuid) -> Self {
    Self { company_code: company_code.into(), task_id }
  }
}

impl fmt::Display for TaskKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.company_code, self.task_id)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: Uuid,
  pub company_id: Uuid,
  pub company_code: String,
  pub project_id: Option<Uuid>,
  pub project_code: Option<String>,
  pub integration_id: Option<Uuid>,
  pub title: String,
  pub status: TaskStatus,
  pub priority: Priority,
  pub attempt_count: i32,
  pub max_attempts: i32,
  pub control: ControlFlags,
  pub runtime: Runtime,
  pub last_error: Option<String>,
  pub deadline_at: Option<DateTime<Utc>>,
  pub last_heartbeat_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Task {
  pub fn key(&self) -> TaskKey {
    TaskKey::new(self.company_code.clone(), self.id)
  }

  pub fn attempts_exhausted(&self) -> bool {
    self.attempt_count >= self.max_attempts
  }
}

/// Insert-side view of a task; identifiers are already resolved.
#[derive(Debug, Clone)]
pub struct NewTask {
  pub company_id: Uuid,
  pub project_id: Option<Uuid>,
  pub integration_id: Option<Uuid>,
  pub title: String,
  pub priority: Priority,
  pub max_attempts: i32,
  pub deadline_at: Option<DateTime<Utc>>,
  pub job: Option<JobSpec>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
  pub limit: i64,
  pub offset: i64,
}

/// One side of a dependency edge as shown in listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyView {
  pub task_id: Uuid,
  pub title: String,
  pub status: TaskStatus,
  pub runtime: Runtime,
  pub control: ControlFlags,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
  #[serde(default)]
  pub base_url: Option<String>,
}

#[derive(Clone, Default, PartialEq, Deserialize)]
pub struct IntegrationSecret {
  #[serde(default)]
  pub callback_secret: Option<String>,
}

impl fmt::Debug for IntegrationSecret {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IntegrationSecret")
      .field("callback_secret", &self.callback_secret.as_ref().map(|_| "<redacted>"))
      .finish()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Integration {
  pub id: Uuid,
  pub company_id: Uuid,
  pub provider_code: String,
  pub is_active: bool,
  pub config: IntegrationConfig,
  #[serde(skip)]
  pub secret: IntegrationSecret,
}

impl Integration {
  pub fn callback_secret(&self) -> Option<&str> {
    self.secret.callback_secret.as_deref().filter(|s| !s.is_empty())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
  Pending,
  Started,
  Success,
  Failure,
}

impl JobPhase {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "PENDING",
      Self::Started => "STARTED",
      Self::Success => "SUCCESS",
      Self::Failure => "FAILURE",
    }
  }
}

impl FromStr for JobPhase {
  type Err = TaskError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "PENDING" => Ok(Self::Pending),
      "STARTED" => Ok(Self::Started),
      "SUCCESS" => Ok(Self::Success),
      "FAILURE" => Ok(Self::Failure),
      other => Err(TaskError::Internal(format!("unknown job state '{other}'"))),
    }
  }
}

/// Result-backend entry for one broker handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobState {
  pub handle: String,
  pub task_id: Uuid,
  pub state: JobPhase,
  pub result: Option<Value>,
  pub error: Option<String>,
  pub updated_at: DateTime<Utc>,
}
