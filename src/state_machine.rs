//! Task transition rules.
//!
//! Every function here patches a loaded [`Task`] in place and returns the
//! events that describe the change. Stores call them while holding the row
//! lock, so a rejected transition (an `Err`) leaves nothing behind.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::TaskError;
use crate::events::{EventKind, NewEvent};
use crate::models::{BlockedInfo, CallbackRecord, CallbackStatus, DispatchTarget, JobSpec, Task, TaskStatus};

/// Who asked for a dispatch; decides which events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOrigin {
  Run,
  Retry,
  Scheduler,
}

impl DispatchOrigin {
  fn enqueued_event(self) -> EventKind {
    match self {
      Self::Run => EventKind::RunEnqueued,
      Self::Retry => EventKind::RetryEnqueued,
      Self::Scheduler => EventKind::DispatchEnqueued,
    }
  }

  fn failed_event(self) -> EventKind {
    match self {
      Self::Run => EventKind::RunEnqueueFailed,
      Self::Retry => EventKind::RetryEnqueueFailed,
      Self::Scheduler => EventKind::DispatchFailed,
    }
  }
}

/// Guards shared by run and retry.
pub fn ensure_runnable(task: &Task, project_code: Option<&str>) -> Result<(), TaskError> {
  if let (Some(own), Some(requested)) = (task.project_code.as_deref(), project_code) {
    if own != requested {
      return Err(TaskError::conflict("task not in this project"));
    }
  }
  match task.status {
    TaskStatus::Done | TaskStatus::Canceled => {
      return Err(TaskError::conflict(format!("cannot run a task in status={}", task.status)));
    }
    TaskStatus::Reserving => return Err(TaskError::conflict("a dispatch is already in progress")),
    _ => {}
  }
  if task.attempts_exhausted() {
    return Err(TaskError::conflict("max attempts reached"));
  }
  Ok(())
}

fn begin_attempt(task: &mut Task, now: DateTime<Utc>) {
  task.last_error = None;
  task.control.reset();
  task.attempt_count += 1;
  task.status = TaskStatus::Reserving;
  task.runtime.reserved_at = Some(now);
}

/// Phase 1 of an explicit run: bind a new job and reserve the task for dispatch.
pub fn prepare_run(
  task: &mut Task,
  project_code: Option<&str>,
  job: JobSpec,
  now: DateTime<Utc>,
) -> Result<Vec<NewEvent>, TaskError> {
  ensure_runnable(task, project_code)?;
  if job.is_webhook_class() && task.integration_id.is_none() {
    return Err(TaskError::Validation("integration_id is required for webhook jobs".into()));
  }

  let payload = json!({ "job_type": job.job_type(), "job_payload": job.payload() });
  let dispatch = DispatchTarget::run_task(&task.company_code, task.id);
  task.runtime.bind_job(job, dispatch);
  begin_attempt(task, now);
  Ok(vec![NewEvent::user(EventKind::RunRequested, now, payload)])
}

/// Phase 1 of a retry: replay the job already bound to the task.
pub fn prepare_retry(task: &mut Task, project_code: Option<&str>, now: DateTime<Utc>) -> Result<Vec<NewEvent>, TaskError> {
  ensure_runnable(task, project_code)?;
  let job_type = match &task.runtime.job {
    Some(job) => job.job_type(),
    None => return Err(TaskError::conflict("no previous job specification to retry")),
  };

  task.runtime.rotate_broker_handle();
  task.runtime.last_retry_at = Some(now);
  task.runtime.reset_execution();
  task.runtime.dispatch = Some(DispatchTarget::run_task(&task.company_code, task.id));
  begin_attempt(task, now);
  Ok(vec![NewEvent::user(
    EventKind::RetryRequested,
    now,
    json!({
      "previous_broker_handle": task.runtime.previous_broker_handle,
      "job_type": job_type,
    }),
  )])
}

/// Whether the scheduler may pick this task up.
pub fn is_dispatch_candidate(task: &Task) -> bool {
  task.status == TaskStatus::Queued
    && task.runtime.job.is_some()
    && task.runtime.broker_handle.is_none()
    && task.control.is_clear()
    && !task.attempts_exhausted()
}

/// Scheduler phase A: same transaction as the candidate selection.
pub fn reserve_for_dispatch(task: &mut Task, now: DateTime<Utc>) -> Result<Vec<NewEvent>, TaskError> {
  if !is_dispatch_candidate(task) {
    return Err(TaskError::conflict("task is not dispatchable"));
  }
  task.runtime.reset_execution();
  task.runtime.dispatch = Some(DispatchTarget::run_task(&task.company_code, task.id));
  begin_attempt(task, now);
  Ok(vec![NewEvent::system(
    EventKind::DispatchReserved,
    now,
    json!({ "attempt_count": task.attempt_count }),
  )])
}

/// Phase 3: the broker accepted the job.
pub fn record_enqueued(task: &mut Task, origin: DispatchOrigin, handle: &str, now: DateTime<Utc>) -> Vec<NewEvent> {
  task.runtime.set_broker_handle(handle);
  task.runtime.enqueued_at = Some(now);
  if task.status == TaskStatus::Reserving {
    task.status = TaskStatus::Queued;
  }
  vec![NewEvent::system(origin.enqueued_event(), now, json!({ "broker_handle": handle }))]
}

/// Phase 2 failed: the task stays consistent and can be retried by hand.
pub fn record_enqueue_failure(task: &mut Task, origin: DispatchOrigin, error: &str, now: DateTime<Utc>) -> Vec<NewEvent> {
  task.status = TaskStatus::Failed;
  task.last_error = Some(error.to_string());
  task.runtime.broker_handle = None;
  vec![NewEvent::system(origin.failed_event(), now, json!({ "error": error }))]
}

/// Whether a delivery for `handle` should be executed or dropped as a duplicate.
pub fn accepts_delivery(task: &Task, handle: &str) -> Result<(), String> {
  if !matches!(task.status, TaskStatus::Reserving | TaskStatus::Queued) {
    return Err(format!("task is {}", task.status));
  }
  match task.runtime.broker_handle.as_deref() {
    Some(current) if current != handle => Err(format!("delivery {handle} superseded by {current}")),
    _ => Ok(()),
  }
}

/// Status writes performed by the worker runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerTransition {
  Start { handle: String },
  Heartbeat,
  Pause,
  Resume,
  Cancel,
  Complete { result: Value },
  Fail { error: String },
  Block(BlockedInfo),
}

pub fn apply_worker_transition(
  task: &mut Task,
  transition: WorkerTransition,
  now: DateTime<Utc>,
) -> Result<Vec<NewEvent>, TaskError> {
  if let WorkerTransition::Start { handle } = &transition {
    accepts_delivery(task, handle).map_err(TaskError::DuplicateDelivery)?;
  }
  if task.status.is_terminal() {
    return Err(TaskError::conflict(format!("task already finished: {}", task.status)));
  }
  task.last_heartbeat_at = Some(now);

  let event = match transition {
    WorkerTransition::Start { handle } => {
      if task.runtime.broker_handle.is_none() {
        task.runtime.set_broker_handle(&handle);
      }
      task.status = TaskStatus::Running;
      task.runtime.mark_started(now);
      NewEvent::system(EventKind::WorkerStarted, now, json!({ "broker_handle": handle }))
    }
    WorkerTransition::Heartbeat => {
      task.runtime.touch_heartbeat(now);
      if task.status == TaskStatus::Running {
        return Ok(Vec::new());
      }
      task.status = TaskStatus::Running;
      NewEvent::system(EventKind::TaskResumed, now, json!({}))
    }
    WorkerTransition::Pause => {
      task.runtime.touch_heartbeat(now);
      task.status = TaskStatus::Paused;
      NewEvent::system(EventKind::TaskPaused, now, json!({}))
    }
    WorkerTransition::Resume => {
      task.runtime.touch_heartbeat(now);
      task.status = TaskStatus::Running;
      NewEvent::system(EventKind::TaskResumed, now, json!({}))
    }
    WorkerTransition::Cancel => {
      task.status = TaskStatus::Canceled;
      task.runtime.mark_finished(now);
      NewEvent::system(EventKind::TaskCanceled, now, json!({}))
    }
    WorkerTransition::Complete { result } => {
      task.status = TaskStatus::Done;
      task.runtime.mark_finished(now);
      NewEvent::system(EventKind::TaskDone, now, json!({ "result": result }))
    }
    WorkerTransition::Fail { error } => {
      task.status = TaskStatus::Failed;
      task.runtime.mark_finished(now);
      task.runtime.worker_error = Some(error.clone());
      task.last_error = Some(error.clone());
      NewEvent::system(EventKind::TaskFailed, now, json!({ "error": error }))
    }
    WorkerTransition::Block(info) => {
      task.status = TaskStatus::Blocked;
      task.runtime.touch_heartbeat(now);
      let payload = json!({
        "blocked_reason": info.reason,
        "integration_id": info.integration_id,
        "external_url": info.external_url,
      });
      task.runtime.block_on(info);
      NewEvent::system(EventKind::TaskBlocked, now, payload)
    }
  };
  Ok(vec![event])
}

/// Completion reported by an external system for a webhook job.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackOutcome {
  pub status: CallbackStatus,
  pub result: Option<Value>,
  pub error: Option<String>,
  pub raw_body: String,
}

pub fn apply_callback(task: &mut Task, outcome: CallbackOutcome, now: DateTime<Utc>) -> Result<Vec<NewEvent>, TaskError> {
  if task.status.is_terminal() {
    return Err(TaskError::conflict(format!("task already finished: {}", task.status)));
  }

  let (status, finished_kind) = match outcome.status {
    CallbackStatus::Done => (TaskStatus::Done, EventKind::TaskDone),
    CallbackStatus::Failed => (TaskStatus::Failed, EventKind::TaskFailed),
  };
  task.status = status;
  if status == TaskStatus::Failed {
    if let Some(error) = &outcome.error {
      task.last_error = Some(error.clone());
    }
  }

  let received = NewEvent::integration(EventKind::CallbackReceived, now, json!({ "status": outcome.status }));
  let finished = NewEvent::system(finished_kind, now, json!({ "error": outcome.error }));
  task.runtime.record_callback(CallbackRecord {
    status: outcome.status,
    result: outcome.result,
    error: outcome.error,
    raw_body: outcome.raw_body,
    received_at: now,
  });
  Ok(vec![received, finished])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{ControlFlags, LongDemoJob, Priority, Runtime};
  use uuid::Uuid;

  fn task(status: TaskStatus) -> Task {
    let now = Utc::now();
    Task {
      id: Uuid::new_v4(),
      company_id: Uuid::new_v4(),
      company_code: "acme".into(),
      project_id: None,
      project_code: Some("alpha".into()),
      integration_id: None,
      title: "demo".into(),
      status,
      priority: Priority::Normal,
      attempt_count: 0,
      max_attempts: 2,
      control: ControlFlags::default(),
      runtime: Runtime::default(),
      last_error: None,
      deadline_at: None,
      last_heartbeat_at: None,
      created_at: now,
      updated_at: now,
    }
  }

  fn demo() -> JobSpec {
    JobSpec::LongDemo(LongDemoJob { seconds: 5 })
  }

  #[test]
  fn run_binds_job_and_reserves() {
    let mut t = task(TaskStatus::Failed);
    t.last_error = Some("boom".into());
    t.control.cancel();
    t.runtime.broker_handle = Some("old".into());

    let events = prepare_run(&mut t, Some("alpha"), demo(), Utc::now()).unwrap();

    assert_eq!(t.status, TaskStatus::Reserving);
    assert_eq!(t.attempt_count, 1);
    assert_eq!(t.last_error, None);
    assert!(t.control.is_clear());
    assert_eq!(t.runtime.broker_handle, None);
    assert_eq!(t.runtime.job, Some(demo()));
    assert_eq!(events[0].kind, EventKind::RunRequested);
    assert_eq!(events[0].payload["job_payload"], json!({"seconds": 5}));
  }

  #[test]
  fn run_refuses_terminal_and_exhausted_tasks() {
    for status in [TaskStatus::Done, TaskStatus::Canceled, TaskStatus::Reserving] {
      let mut t = task(status);
      assert!(matches!(prepare_run(&mut t, None, demo(), Utc::now()), Err(TaskError::Conflict(_))));
    }
    let mut t = task(TaskStatus::Failed);
    t.attempt_count = 2;
    let before = t.clone();
    assert!(matches!(prepare_run(&mut t, None, demo(), Utc::now()), Err(TaskError::Conflict(_))));
    assert_eq!(t, before);
  }

  #[test]
  fn run_refuses_other_project() {
    let mut t = task(TaskStatus::Queued);
    assert!(matches!(prepare_run(&mut t, Some("beta"), demo(), Utc::now()), Err(TaskError::Conflict(_))));
  }

  #[test]
  fn retry_needs_a_stored_job() {
    let mut t = task(TaskStatus::Failed);
    assert!(matches!(prepare_retry(&mut t, None, Utc::now()), Err(TaskError::Conflict(_))));
  }

  #[test]
  fn retry_rotates_handle() {
    let mut t = task(TaskStatus::Failed);
    t.runtime.job = Some(demo());
    t.runtime.broker_handle = Some("first".into());
    t.attempt_count = 1;

    let events = prepare_retry(&mut t, Some("alpha"), Utc::now()).unwrap();

    assert_eq!(t.attempt_count, 2);
    assert_eq!(t.runtime.broker_handle, None);
    assert_eq!(t.runtime.previous_broker_handle.as_deref(), Some("first"));
    assert!(t.runtime.last_retry_at.is_some());
    assert_eq!(events[0].payload["previous_broker_handle"], json!("first"));

    record_enqueued(&mut t, DispatchOrigin::Retry, "second", Utc::now());
    assert_eq!(t.status, TaskStatus::Queued);
    assert_eq!(t.runtime.previous_broker_handle.as_deref(), Some("first"));
  }

  #[test]
  fn candidates_need_job_no_handle_and_clear_flags() {
    let mut t = task(TaskStatus::Queued);
    assert!(!is_dispatch_candidate(&t));
    t.runtime.job = Some(demo());
    assert!(is_dispatch_candidate(&t));
    t.control.set_pause();
    assert!(!is_dispatch_candidate(&t));
    t.control.reset();
    t.runtime.broker_handle = Some("h".into());
    assert!(!is_dispatch_candidate(&t));
  }

  #[test]
  fn reserved_task_is_no_longer_a_candidate() {
    let mut t = task(TaskStatus::Queued);
    t.runtime.job = Some(demo());
    reserve_for_dispatch(&mut t, Utc::now()).unwrap();
    assert_eq!(t.status, TaskStatus::Reserving);
    assert_eq!(t.attempt_count, 1);
    assert!(!is_dispatch_candidate(&t));
    assert!(reserve_for_dispatch(&mut t, Utc::now()).is_err());
  }

  #[test]
  fn finalize_does_not_rewind_a_started_task() {
    let mut t = task(TaskStatus::Running);
    record_enqueued(&mut t, DispatchOrigin::Run, "h", Utc::now());
    assert_eq!(t.status, TaskStatus::Running);
  }

  #[test]
  fn duplicate_deliveries_are_refused() {
    let mut t = task(TaskStatus::Queued);
    assert!(accepts_delivery(&t, "h1").is_ok());
    t.runtime.broker_handle = Some("h1".into());
    assert!(accepts_delivery(&t, "h1").is_ok());
    assert!(accepts_delivery(&t, "h0").is_err());
    t.status = TaskStatus::Running;
    assert!(accepts_delivery(&t, "h1").is_err());
  }

  #[test]
  fn start_rechecks_delivery_under_the_lock() {
    let mut t = task(TaskStatus::Queued);
    t.runtime.broker_handle = Some("h1".into());
    apply_worker_transition(&mut t, WorkerTransition::Start { handle: "h1".into() }, Utc::now()).unwrap();
    assert_eq!(t.status, TaskStatus::Running);

    let again = apply_worker_transition(&mut t, WorkerTransition::Start { handle: "h1".into() }, Utc::now());
    assert!(matches!(again, Err(TaskError::DuplicateDelivery(_))));

    let mut t = task(TaskStatus::Queued);
    t.runtime.broker_handle = Some("h2".into());
    let stale = apply_worker_transition(&mut t, WorkerTransition::Start { handle: "h1".into() }, Utc::now());
    assert!(matches!(stale, Err(TaskError::DuplicateDelivery(_))));
    assert_eq!(t.status, TaskStatus::Queued);
  }

  #[test]
  fn heartbeat_while_running_emits_nothing() {
    let mut t = task(TaskStatus::Running);
    let events = apply_worker_transition(&mut t, WorkerTransition::Heartbeat, Utc::now()).unwrap();
    assert!(events.is_empty());
    assert!(t.last_heartbeat_at.is_some());
  }

  #[test]
  fn worker_cannot_reopen_finished_task() {
    let mut t = task(TaskStatus::Done);
    assert!(apply_worker_transition(&mut t, WorkerTransition::Pause, Utc::now()).is_err());
  }

  #[test]
  fn failure_records_error() {
    let mut t = task(TaskStatus::Running);
    apply_worker_transition(&mut t, WorkerTransition::Fail { error: "boom".into() }, Utc::now()).unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.last_error.as_deref(), Some("boom"));
    assert!(t.runtime.worker_finished_at.is_some());
  }

  #[test]
  fn callback_finishes_blocked_task_once() {
    let mut t = task(TaskStatus::Blocked);
    let outcome = CallbackOutcome {
      status: CallbackStatus::Done,
      result: Some(json!({"rows": 3})),
      error: None,
      raw_body: r#"{"status":"done"}"#.into(),
    };
    let events = apply_callback(&mut t, outcome.clone(), Utc::now()).unwrap();
    assert_eq!(t.status, TaskStatus::Done);
    assert_eq!(events.iter().map(|e| e.kind).collect::<Vec<_>>(), vec![EventKind::CallbackReceived, EventKind::TaskDone]);
    assert_eq!(t.runtime.callback.as_ref().map(|c| c.raw_body.as_str()), Some(r#"{"status":"done"}"#));

    assert!(matches!(apply_callback(&mut t, outcome, Utc::now()), Err(TaskError::Conflict(_))));
  }
}
