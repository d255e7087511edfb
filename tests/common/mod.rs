#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use taskhub::config::{ApiSettings, WorkerSettings};
use taskhub::events::{EventKind, NewEvent};
use taskhub::messaging::MemoryBroker;
use taskhub::models::{JobSpec, NewTask, Priority, Task, TaskKey};
use taskhub::routes::AppState;
use taskhub::store::{MemoryTaskStore, TaskStore};

pub const COMPANY: &str = "acme";
pub const PROJECT: &str = "alpha";
pub const SECRET: &str = "whsec_test";

pub struct Fixture {
  pub store: Arc<MemoryTaskStore>,
  pub broker: Arc<MemoryBroker>,
  pub company_id: Uuid,
  pub project_id: Uuid,
  pub integration_id: Uuid,
}

impl Fixture {
  pub async fn new() -> Self {
    Self::with_base_url(None).await
  }

  pub async fn with_base_url(base_url: Option<&str>) -> Self {
    let store = Arc::new(MemoryTaskStore::new());
    let company_id = store.add_company(COMPANY).await;
    let project_id = store.add_project(company_id, PROJECT).await;
    let integration_id = store.add_integration(company_id, "generic", base_url, Some(SECRET)).await;
    Self {
      store,
      broker: Arc::new(MemoryBroker::new()),
      company_id,
      project_id,
      integration_id,
    }
  }

  pub fn dyn_store(&self) -> Arc<dyn TaskStore> {
    self.store.clone()
  }

  pub fn state(&self) -> AppState {
    AppState::new(self.dyn_store(), self.broker.clone(), &ApiSettings::default())
  }

  pub async fn task(&self, job: Option<JobSpec>) -> Task {
    self.task_with(job, None, 5).await
  }

  pub async fn task_with(&self, job: Option<JobSpec>, integration_id: Option<Uuid>, max_attempts: i32) -> Task {
    self
      .store
      .create_task(
        NewTask {
          company_id: self.company_id,
          project_id: Some(self.project_id),
          integration_id,
          title: "fixture task".into(),
          priority: Priority::Normal,
          max_attempts,
          deadline_at: None,
          job,
        },
        NewEvent::user(EventKind::TaskCreated, Utc::now(), json!({})),
      )
      .await
      .unwrap()
  }

  pub async fn reload(&self, key: &TaskKey) -> Task {
    self.store.get_task(key).await.unwrap().unwrap()
  }

  pub async fn event_types(&self, key: &TaskKey) -> Vec<String> {
    self.store.list_events(key, 500).await.unwrap().into_iter().map(|e| e.event_type).collect()
  }
}

pub fn long_demo(seconds: u64) -> JobSpec {
  JobSpec::from_parts("long_demo", json!({ "seconds": seconds })).unwrap()
}

pub fn echo(message: &str) -> JobSpec {
  JobSpec::from_parts("echo", json!({ "message": message })).unwrap()
}

pub fn webhook(payload: Value) -> JobSpec {
  JobSpec::from_parts("webhook", payload).unwrap()
}

/// Worker settings with short intervals; sleeps still go through tokio time.
pub fn worker_settings() -> WorkerSettings {
  WorkerSettings {
    pause_poll: Duration::from_secs(1),
    work_unit: Duration::from_secs(1),
    heartbeat_every: 5,
    webhook_timeout: Duration::from_secs(5),
    ..WorkerSettings::default()
  }
}
