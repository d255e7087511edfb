//! Pause/resume/cancel/reset. Only the control flags change; the worker
//! observes them on its next poll and moves the status itself.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use crate::error::TaskError;
use crate::events::{EventKind, NewEvent};
use crate::models::{ControlFlags, Task, TaskKey};
use crate::store::TaskStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
  Pause,
  Resume,
  Cancel,
  Reset,
}

impl ControlOp {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pause => "pause",
      Self::Resume => "resume",
      Self::Cancel => "cancel",
      Self::Reset => "reset",
    }
  }

  fn event_kind(&self) -> EventKind {
    match self {
      Self::Pause => EventKind::Pause,
      Self::Resume => EventKind::Resume,
      Self::Cancel => EventKind::Cancel,
      Self::Reset => EventKind::Reset,
    }
  }
}

impl FromStr for ControlOp {
  type Err = TaskError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pause" => Ok(Self::Pause),
      "resume" => Ok(Self::Resume),
      "cancel" => Ok(Self::Cancel),
      "reset" => Ok(Self::Reset),
      other => Err(TaskError::BadRequest(format!("unknown control operation '{other}'"))),
    }
  }
}

pub fn apply_control(task: &mut Task, op: ControlOp, now: DateTime<Utc>) -> Vec<NewEvent> {
  match op {
    ControlOp::Pause => task.control.set_pause(),
    ControlOp::Resume => task.control.resume(),
    ControlOp::Cancel => task.control.cancel(),
    ControlOp::Reset => task.control.reset(),
  }
  vec![NewEvent::user(
    op.event_kind(),
    now,
    json!({ "pause": task.control.pause, "cancel": task.control.cancel }),
  )]
}

#[derive(Clone)]
pub struct ControlPlane {
  store: Arc<dyn TaskStore>,
}

impl ControlPlane {
  pub fn new(store: Arc<dyn TaskStore>) -> Self {
    Self { store }
  }

  pub async fn apply(&self, key: &TaskKey, op: ControlOp) -> Result<ControlFlags, TaskError> {
    let task = self
      .store
      .mutate_task(key, Box::new(move |task: &mut Task| Ok(apply_control(task, op, Utc::now()))))
      .await?;
    info!(task = %key, op = op.as_str(), pause = task.control.pause, cancel = task.control.cancel, "control updated");
    Ok(task.control)
  }
}
