use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use crate::config::WorkerSettings;
use crate::error::TaskError;
use crate::messaging::JobMessage;
use crate::models::{JobPhase, JobState, Task};
use crate::state_machine::{WorkerTransition, accepts_delivery};
use crate::store::TaskStore;
use crate::worker_processing::{JobContext, JobResult, TaskReporter, process_job};

#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
  Completed(Value),
  Canceled,
  Blocked,
  /// Delivery acknowledged without running anything.
  Skipped(String),
}

/// Executes broker deliveries against the task store.
pub struct WorkerRuntime {
  store: Arc<dyn TaskStore>,
  http: reqwest::Client,
  settings: WorkerSettings,
}

impl WorkerRuntime {
  pub fn new(store: Arc<dyn TaskStore>, settings: WorkerSettings) -> Result<Self, TaskError> {
    let http = reqwest::Client::builder()
      .timeout(settings.webhook_timeout)
      .build()
      .map_err(|e| TaskError::Internal(format!("http client: {e}")))?;
    Ok(Self { store, http, settings })
  }

  pub fn settings(&self) -> &WorkerSettings {
    &self.settings
  }

  #[instrument(skip_all, fields(handle = %message.handle, worker = %self.settings.worker_id))]
  pub async fn execute(&self, message: &JobMessage) -> Result<Execution, TaskError> {
    let key = message.task_key().map_err(|e| TaskError::BadRequest(e.to_string()))?;
    let Some(task) = self.store.get_task(&key).await? else {
      warn!(task = %key, "delivery for unknown task");
      return Ok(Execution::Skipped("task not found".into()));
    };
    if let Err(reason) = accepts_delivery(&task, &message.handle) {
      info!(task = %key, reason = %reason, "duplicate delivery skipped");
      return Ok(Execution::Skipped(reason));
    }
    let Some(job) = task.runtime.job.clone() else {
      return Ok(Execution::Skipped("task has no job".into()));
    };

    let reporter = TaskReporter::new(self.store.clone(), key.clone());
    // The snapshot check above is advisory; the locked start decides.
    let task = match reporter.transition(WorkerTransition::Start { handle: message.handle.clone() }).await {
      Ok(task) => task,
      Err(TaskError::DuplicateDelivery(reason)) => {
        info!(task = %key, reason = %reason, "duplicate delivery skipped");
        return Ok(Execution::Skipped(reason));
      }
      Err(e) => return Err(e),
    };
    self.record(&task, &message.handle, JobPhase::Started, None, None).await;
    info!(task = %key, job_type = job.job_type(), attempt = task.attempt_count, "job started");

    let ctx = JobContext {
      reporter: &reporter,
      store: &self.store,
      http: &self.http,
      settings: &self.settings,
      task: &task,
    };
    match process_job(&ctx, &job).await {
      Ok(JobResult::Completed(result)) => {
        reporter.transition(WorkerTransition::Complete { result: result.clone() }).await?;
        self.record(&task, &message.handle, JobPhase::Success, Some(result.clone()), None).await;
        info!(task = %key, "job done");
        Ok(Execution::Completed(result))
      }
      Ok(JobResult::Canceled(result)) => {
        reporter.transition(WorkerTransition::Cancel).await?;
        self.record(&task, &message.handle, JobPhase::Success, Some(result), None).await;
        Ok(Execution::Canceled)
      }
      Ok(JobResult::Blocked(info)) => {
        reporter.transition(WorkerTransition::Block(info)).await?;
        self
          .record(&task, &message.handle, JobPhase::Success, Some(json!({ "blocked": true })), None)
          .await;
        Ok(Execution::Blocked)
      }
      Err(e) => {
        let message_text = match &e {
          TaskError::Execution(detail) => detail.clone(),
          other => other.to_string(),
        };
        error!(task = %key, error = %message_text, "job failed");
        if let Err(write_error) = reporter.transition(WorkerTransition::Fail { error: message_text.clone() }).await {
          error!(task = %key, error = %write_error, "could not record job failure");
        }
        self
          .record(&task, &message.handle, JobPhase::Failure, None, Some(message_text))
          .await;
        Err(e)
      }
    }
  }

  // Result-backend writes never fail the delivery.
  async fn record(&self, task: &Task, handle: &str, state: JobPhase, result: Option<Value>, error: Option<String>) {
    let entry = JobState {
      handle: handle.to_string(),
      task_id: task.id,
      state,
      result,
      error,
      updated_at: Utc::now(),
    };
    if let Err(e) = self.store.record_job_state(&entry).await {
      warn!(handle = %handle, error = %e, "could not record job state");
    }
  }
}
