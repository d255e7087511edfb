//! Run/retry protocol: prepare under the row lock, enqueue outside any
//! transaction, then finalize (or record the failure) in a new transaction.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::error::TaskError;
use crate::messaging::Broker;
use crate::models::{JobSpec, Task, TaskKey};
use crate::state_machine::{self, DispatchOrigin};
use crate::store::TaskStore;

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct RunReceipt {
  pub task: Task,
  pub broker_handle: String,
  pub broker_task_name: String,
}

#[derive(Clone)]
pub struct Dispatcher {
  store: Arc<dyn TaskStore>,
  broker: Arc<dyn Broker>,
}

impl Dispatcher {
  pub fn new(store: Arc<dyn TaskStore>, broker: Arc<dyn Broker>) -> Self {
    Self { store, broker }
  }

  #[instrument(skip_all, fields(task = %key))]
  pub async fn run(&self, key: &TaskKey, project_code: Option<&str>, job: JobSpec) -> Result<RunReceipt, TaskError> {
    let project = project_code.map(str::to_string);
    let task = self
      .store
      .mutate_task(
        key,
        Box::new(move |task: &mut Task| state_machine::prepare_run(task, project.as_deref(), job, Utc::now())),
      )
      .await?;
    info!(attempt = task.attempt_count, "run prepared");
    self.enqueue(task, DispatchOrigin::Run).await
  }

  #[instrument(skip_all, fields(task = %key))]
  pub async fn retry(&self, key: &TaskKey, project_code: Option<&str>) -> Result<RunReceipt, TaskError> {
    let project = project_code.map(str::to_string);
    let task = self
      .store
      .mutate_task(
        key,
        Box::new(move |task: &mut Task| state_machine::prepare_retry(task, project.as_deref(), Utc::now())),
      )
      .await?;
    info!(attempt = task.attempt_count, "retry prepared");
    self.enqueue(task, DispatchOrigin::Retry).await
  }

  /// Phases B and C for a task the scheduler already reserved.
  pub async fn dispatch_reserved(&self, task: Task) -> Result<RunReceipt, TaskError> {
    self.enqueue(task, DispatchOrigin::Scheduler).await
  }

  async fn enqueue(&self, task: Task, origin: DispatchOrigin) -> Result<RunReceipt, TaskError> {
    let key = task.key();
    let Some(target) = task.runtime.dispatch.clone() else {
      return Err(TaskError::Internal(format!("task {key} has no dispatch target")));
    };

    match self.broker.submit(&target).await {
      Ok(handle) => {
        let recorded = handle.clone();
        let task = self
          .store
          .mutate_task(
            &key,
            Box::new(move |task: &mut Task| Ok(state_machine::record_enqueued(task, origin, &recorded, Utc::now()))),
          )
          .await?;
        info!(task_id = %task.id, handle = %handle, "job enqueued");
        Ok(RunReceipt {
          task,
          broker_handle: handle,
          broker_task_name: target.name,
        })
      }
      Err(broker_error) => {
        let message = broker_error.to_string();
        warn!(task = %key, error = %message, "enqueue failed");
        let recorded = message.clone();
        if let Err(store_error) = self
          .store
          .mutate_task(
            &key,
            Box::new(move |task: &mut Task| {
              Ok(state_machine::record_enqueue_failure(task, origin, &recorded, Utc::now()))
            }),
          )
          .await
        {
          error!(task = %key, error = %store_error, "could not record enqueue failure");
        }
        Err(TaskError::Dispatch(message))
      }
    }
  }
}
