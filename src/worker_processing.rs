use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::WorkerSettings;
use crate::error::TaskError;
use crate::models::{BlockedInfo, ControlFlags, EchoJob, JobSpec, LongDemoJob, Task, TaskKey, WebhookJob};
use crate::state_machine::{WorkerTransition, apply_worker_transition};
use crate::store::TaskStore;

/// What the worker does after reading the control flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
  Proceed,
  EnterPause,
  StayPaused,
  Resume,
  Cancel,
}

/// Cooperative pause/cancel state. Cancel wins over pause, and the paused
/// and resumed transitions are reported once per edge.
#[derive(Debug, Default)]
pub struct ControlGate {
  paused: bool,
}

impl ControlGate {
  pub fn observe(&mut self, flags: ControlFlags) -> GateDecision {
    if flags.cancel {
      return GateDecision::Cancel;
    }
    match (flags.pause, self.paused) {
      (true, false) => {
        self.paused = true;
        GateDecision::EnterPause
      }
      (true, true) => GateDecision::StayPaused,
      (false, true) => {
        self.paused = false;
        GateDecision::Resume
      }
      (false, false) => GateDecision::Proceed,
    }
  }

  pub fn is_paused(&self) -> bool {
    self.paused
  }
}

/// Writes worker transitions for one task.
#[derive(Clone)]
pub struct TaskReporter {
  store: Arc<dyn TaskStore>,
  key: TaskKey,
}

impl TaskReporter {
  pub fn new(store: Arc<dyn TaskStore>, key: TaskKey) -> Self {
    Self { store, key }
  }

  pub fn key(&self) -> &TaskKey {
    &self.key
  }

  pub async fn transition(&self, transition: WorkerTransition) -> Result<Task, TaskError> {
    self
      .store
      .mutate_task(
        &self.key,
        Box::new(move |task: &mut Task| apply_worker_transition(task, transition, Utc::now())),
      )
      .await
  }

  pub async fn control(&self) -> Result<ControlFlags, TaskError> {
    self.store.read_control(&self.key).await?.ok_or(TaskError::NotFound("task"))
  }
}

pub enum JobResult {
  Completed(Value),
  Canceled(Value),
  Blocked(BlockedInfo),
}

pub struct JobContext<'a> {
  pub reporter: &'a TaskReporter,
  pub store: &'a Arc<dyn TaskStore>,
  pub http: &'a reqwest::Client,
  pub settings: &'a WorkerSettings,
  pub task: &'a Task,
}

pub async fn process_job(ctx: &JobContext<'_>, job: &JobSpec) -> Result<JobResult, TaskError> {
  match job {
    JobSpec::LongDemo(job) => process_long_demo(ctx, job).await,
    JobSpec::Echo(job) => process_echo(job),
    JobSpec::Webhook(job) => process_webhook(ctx, job).await,
  }
}

pub async fn process_long_demo(ctx: &JobContext<'_>, job: &LongDemoJob) -> Result<JobResult, TaskError> {
  let heartbeat_every = ctx.settings.heartbeat_every.max(1);
  let mut gate = ControlGate::default();
  let mut elapsed: u64 = 0;

  while elapsed < job.seconds {
    match gate.observe(ctx.reporter.control().await?) {
      GateDecision::Cancel => {
        info!(task = %ctx.reporter.key(), elapsed, "canceled by control flag");
        return Ok(JobResult::Canceled(json!({ "ok": false, "state": "CANCELED", "elapsed": elapsed })));
      }
      GateDecision::EnterPause => {
        ctx.reporter.transition(WorkerTransition::Pause).await?;
        sleep(ctx.settings.pause_poll).await;
        continue;
      }
      GateDecision::StayPaused => {
        sleep(ctx.settings.pause_poll).await;
        continue;
      }
      GateDecision::Resume => {
        ctx.reporter.transition(WorkerTransition::Resume).await?;
      }
      GateDecision::Proceed => {}
    }

    sleep(ctx.settings.work_unit).await;
    elapsed += 1;
    if elapsed % heartbeat_every == 0 {
      ctx.reporter.transition(WorkerTransition::Heartbeat).await?;
      debug!(task = %ctx.reporter.key(), elapsed, "heartbeat");
    }
  }

  Ok(JobResult::Completed(json!({ "ok": true, "state": "DONE", "elapsed": elapsed })))
}

pub fn process_echo(job: &EchoJob) -> Result<JobResult, TaskError> {
  Ok(JobResult::Completed(json!({ "echo": job.message })))
}

fn join_url(base: &str, path: &str) -> String {
  format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn resolve_target(ctx: &JobContext<'_>, job: &WebhookJob) -> Result<String, TaskError> {
  if let Some(url) = &job.url {
    return Ok(url.clone());
  }
  let path = job.path.as_deref().ok_or_else(|| TaskError::Execution("webhook job has neither url nor path".into()))?;
  let integration_id = ctx
    .task
    .integration_id
    .ok_or_else(|| TaskError::Execution("webhook path needs an integration".into()))?;
  let integration = ctx
    .store
    .integration(ctx.task.company_id, integration_id)
    .await?
    .ok_or_else(|| TaskError::Execution(format!("integration {integration_id} not found")))?;
  let base = integration
    .config
    .base_url
    .filter(|b| !b.is_empty())
    .ok_or_else(|| TaskError::Execution("integration has no base_url".into()))?;
  Ok(join_url(&base, path))
}

/// Posts the envelope to the external system and parks the task until it calls back.
pub async fn process_webhook(ctx: &JobContext<'_>, job: &WebhookJob) -> Result<JobResult, TaskError> {
  let url = resolve_target(ctx, job).await?;
  let callback_url = format!(
    "{}/companies/{}/tasks/{}/callback",
    ctx.settings.callback_base_url, ctx.task.company_code, ctx.task.id
  );
  let envelope = json!({
    "company_code": ctx.task.company_code,
    "task_id": ctx.task.id,
    "payload": job.body,
    "callback_url": callback_url,
  });

  let response = ctx
    .http
    .post(&url)
    .json(&envelope)
    .send()
    .await
    .map_err(|e| TaskError::Execution(format!("webhook request failed: {e}")))?;
  let status = response.status();
  if !status.is_success() {
    return Err(TaskError::Execution(format!("webhook returned {status}")));
  }

  info!(task = %ctx.reporter.key(), url = %url, "webhook triggered, awaiting callback");
  Ok(JobResult::Blocked(BlockedInfo {
    reason: "awaiting_callback".into(),
    integration_id: ctx.task.integration_id,
    external_url: url,
    triggered_at: Utc::now(),
  }))
}
