mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Fixture, PROJECT, SECRET, echo, long_demo, webhook, worker_settings};
use serde_json::{Value, json};
use taskhub::callback::{CallbackVerifier, sign};
use taskhub::control::{ControlOp, ControlPlane};
use taskhub::dispatcher::Dispatcher;
use taskhub::error::TaskError;
use taskhub::events::{NewEvent, TaskEvent};
use taskhub::messaging::JobMessage;
use taskhub::models::{ControlFlags, DependencyView, Integration, JobSpec, JobState, NewTask, Page, Task, TaskKey, TaskStatus};
use taskhub::store::{MemoryTaskStore, Mutation, TaskStore};
use uuid::Uuid;
use taskhub::worker_runtime::{Execution, WorkerRuntime};
use tokio::sync::mpsc;
use warp::Filter;
use warp::http::StatusCode;

async fn dispatch(fx: &Fixture, task: &Task, job: JobSpec) -> JobMessage {
  Dispatcher::new(fx.dyn_store(), fx.broker.clone())
    .run(&task.key(), Some(PROJECT), job)
    .await
    .unwrap();
  fx.broker.submitted().pop().unwrap()
}

fn runtime(fx: &Fixture) -> Arc<WorkerRuntime> {
  Arc::new(WorkerRuntime::new(fx.dyn_store(), worker_settings()).unwrap())
}

#[tokio::test(start_paused = true)]
async fn pause_then_resume_finishes_the_full_duration() {
  let fx = Fixture::new().await;
  let task = fx.task(None).await;
  let message = dispatch(&fx, &task, long_demo(5)).await;
  let worker = runtime(&fx);
  let control = ControlPlane::new(fx.dyn_store());

  let running = {
    let worker = worker.clone();
    tokio::spawn(async move { worker.execute(&message).await })
  };

  tokio::time::sleep(Duration::from_millis(2500)).await;
  assert_eq!(fx.reload(&task.key()).await.status, TaskStatus::Running);
  control.apply(&task.key(), ControlOp::Pause).await.unwrap();

  // The flag is seen at the next unit boundary, then the first poll runs.
  let settings = worker.settings();
  tokio::time::sleep(settings.work_unit + settings.pause_poll).await;
  assert_eq!(fx.reload(&task.key()).await.status, TaskStatus::Paused);
  control.apply(&task.key(), ControlOp::Resume).await.unwrap();

  let outcome = running.await.unwrap().unwrap();
  let result = match outcome {
    Execution::Completed(result) => result,
    other => panic!("expected completion, got {other:?}"),
  };
  assert_eq!(result["state"], json!("DONE"));
  assert!(result["elapsed"].as_u64().unwrap() >= 5);

  let stored = fx.reload(&task.key()).await;
  assert_eq!(stored.status, TaskStatus::Done);
  let events = fx.event_types(&task.key()).await;
  assert_eq!(events.iter().filter(|e| *e == "task_done").count(), 1);
  assert!(events.iter().any(|e| e == "task_paused"));
  assert!(events.iter().any(|e| e == "task_resumed"));
}

#[tokio::test(start_paused = true)]
async fn heartbeats_refresh_timestamps_without_events() {
  let fx = Fixture::new().await;
  let task = fx.task(None).await;
  let message = dispatch(&fx, &task, long_demo(12)).await;
  let worker = runtime(&fx);

  let running = {
    let worker = worker.clone();
    tokio::spawn(async move { worker.execute(&message).await })
  };

  let mut samples = Vec::new();
  for wait in [500, 5000, 5000] {
    tokio::time::sleep(Duration::from_millis(wait)).await;
    let stored = fx.reload(&task.key()).await;
    assert_eq!(stored.status, TaskStatus::Running);
    samples.push((stored.last_heartbeat_at.unwrap(), stored.runtime.worker_last_heartbeat_at.unwrap()));
  }
  assert!(samples[1].0 > samples[0].0 && samples[2].0 > samples[1].0);
  assert!(samples[1].1 > samples[0].1 && samples[2].1 > samples[1].1);

  assert!(matches!(running.await.unwrap().unwrap(), Execution::Completed(_)));
  assert_eq!(
    fx.event_types(&task.key()).await,
    ["task_created", "run_requested", "run_enqueued", "worker_started", "task_done"]
  );
}

/// Memory store whose reads yield, so concurrent deliveries interleave.
struct YieldingStore(Arc<MemoryTaskStore>);

#[async_trait]
impl TaskStore for YieldingStore {
  async fn company_id(&self, company_code: &str) -> Result<Option<Uuid>, TaskError> {
    self.0.company_id(company_code).await
  }

  async fn project_id(&self, company_id: Uuid, project_code: &str) -> Result<Option<Uuid>, TaskError> {
    self.0.project_id(company_id, project_code).await
  }

  async fn integration(&self, company_id: Uuid, integration_id: Uuid) -> Result<Option<Integration>, TaskError> {
    self.0.integration(company_id, integration_id).await
  }

  async fn create_task(&self, task: NewTask, created: NewEvent) -> Result<Task, TaskError> {
    self.0.create_task(task, created).await
  }

  async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>, TaskError> {
    let task = self.0.get_task(key).await;
    tokio::task::yield_now().await;
    task
  }

  async fn list_tasks(&self, company_id: Uuid, project_id: Uuid, page: Page) -> Result<Vec<Task>, TaskError> {
    self.0.list_tasks(company_id, project_id, page).await
  }

  async fn mutate_task(&self, key: &TaskKey, mutation: Mutation) -> Result<Task, TaskError> {
    self.0.mutate_task(key, mutation).await
  }

  async fn reserve_dispatchable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError> {
    self.0.reserve_dispatchable(limit, now).await
  }

  async fn read_control(&self, key: &TaskKey) -> Result<Option<ControlFlags>, TaskError> {
    self.0.read_control(key).await
  }

  async fn add_dependencies(&self, waiter: &TaskKey, dependees: &[Uuid], event: NewEvent) -> Result<u64, TaskError> {
    self.0.add_dependencies(waiter, dependees, event).await
  }

  async fn list_dependencies(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError> {
    self.0.list_dependencies(key).await
  }

  async fn list_dependents(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError> {
    self.0.list_dependents(key).await
  }

  async fn list_events(&self, key: &TaskKey, limit: i64) -> Result<Vec<TaskEvent>, TaskError> {
    self.0.list_events(key, limit).await
  }

  async fn record_job_state(&self, state: &JobState) -> Result<(), TaskError> {
    self.0.record_job_state(state).await
  }

  async fn job_state(&self, handle: &str) -> Result<Option<JobState>, TaskError> {
    self.0.job_state(handle).await
  }
}

#[tokio::test(start_paused = true)]
async fn concurrent_deliveries_of_one_handle_start_once() {
  let fx = Fixture::new().await;
  let task = fx.task(None).await;
  let message = dispatch(&fx, &task, long_demo(3)).await;
  let store: Arc<dyn TaskStore> = Arc::new(YieldingStore(fx.store.clone()));
  let first = WorkerRuntime::new(store.clone(), worker_settings()).unwrap();
  let second = WorkerRuntime::new(store, worker_settings()).unwrap();

  let (a, b) = tokio::join!(first.execute(&message), second.execute(&message));

  let outcomes = [a.unwrap(), b.unwrap()];
  assert_eq!(outcomes.iter().filter(|o| matches!(o, Execution::Completed(_))).count(), 1);
  assert_eq!(outcomes.iter().filter(|o| matches!(o, Execution::Skipped(_))).count(), 1);
  let events = fx.event_types(&task.key()).await;
  assert_eq!(events.iter().filter(|e| *e == "worker_started").count(), 1);
  assert_eq!(events.iter().filter(|e| *e == "task_done").count(), 1);
  assert_eq!(fx.reload(&task.key()).await.status, TaskStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_first_unit_ends_as_canceled() {
  let fx = Fixture::new().await;
  let task = fx.task(None).await;
  let message = dispatch(&fx, &task, long_demo(5)).await;
  ControlPlane::new(fx.dyn_store()).apply(&task.key(), ControlOp::Cancel).await.unwrap();

  let outcome = runtime(&fx).execute(&message).await.unwrap();

  assert_eq!(outcome, Execution::Canceled);
  let stored = fx.reload(&task.key()).await;
  assert_eq!(stored.status, TaskStatus::Canceled);
  assert_eq!(stored.last_error, None);
  assert!(stored.runtime.worker_finished_at.is_some());
  let job = fx.store.job_state(&message.handle).await.unwrap().unwrap();
  assert_eq!(job.result.unwrap()["state"], json!("CANCELED"));
}

#[tokio::test]
async fn echo_completes_and_redelivery_is_skipped() {
  let fx = Fixture::new().await;
  let task = fx.task(None).await;
  let message = dispatch(&fx, &task, echo("hello")).await;
  let worker = runtime(&fx);

  let outcome = worker.execute(&message).await.unwrap();
  assert_eq!(outcome, Execution::Completed(json!({ "echo": "hello" })));

  let again = worker.execute(&message).await.unwrap();
  assert!(matches!(again, Execution::Skipped(_)));
  let events = fx.event_types(&task.key()).await;
  assert_eq!(events.iter().filter(|e| *e == "worker_started").count(), 1);
  assert_eq!(events.iter().filter(|e| *e == "task_done").count(), 1);
}

#[tokio::test]
async fn superseded_handle_is_skipped() {
  let fx = Fixture::new().await;
  let task = fx.task(None).await;
  let message = dispatch(&fx, &task, echo("x")).await;
  let stale = JobMessage { handle: "stale-handle".into(), ..message };

  let outcome = runtime(&fx).execute(&stale).await.unwrap();

  assert!(matches!(outcome, Execution::Skipped(_)));
  assert_eq!(fx.reload(&task.key()).await.status, TaskStatus::Queued);
}

async fn external_system(status: StatusCode) -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
  let (tx, rx) = mpsc::unbounded_channel();
  let hook = warp::post()
    .and(warp::path!("hooks" / "run"))
    .and(warp::body::json())
    .map(move |envelope: Value| {
      let _ = tx.send(envelope);
      warp::reply::with_status(warp::reply::json(&json!({ "accepted": true })), status)
    });
  let (addr, server) = warp::serve(hook).bind_ephemeral(([127, 0, 0, 1], 0));
  tokio::spawn(server);
  (addr, rx)
}

#[tokio::test]
async fn webhook_blocks_until_signed_callback_arrives() {
  let (addr, mut received) = external_system(StatusCode::ACCEPTED).await;
  let base_url = format!("http://{addr}");
  let fx = Fixture::with_base_url(Some(base_url.as_str())).await;
  let task = fx.task_with(None, Some(fx.integration_id), 3).await;
  let message = dispatch(&fx, &task, webhook(json!({ "path": "/hooks/run", "body": { "order": 7 } }))).await;

  let outcome = runtime(&fx).execute(&message).await.unwrap();
  assert_eq!(outcome, Execution::Blocked);

  let envelope = received.recv().await.unwrap();
  assert_eq!(envelope["company_code"], json!("acme"));
  assert_eq!(envelope["payload"], json!({ "order": 7 }));
  assert!(envelope["callback_url"].as_str().unwrap().ends_with(&format!("/companies/acme/tasks/{}/callback", task.id)));

  let blocked = fx.reload(&task.key()).await;
  assert_eq!(blocked.status, TaskStatus::Blocked);
  let info = blocked.runtime.blocked.unwrap();
  assert_eq!(info.reason, "awaiting_callback");
  assert_eq!(info.external_url, format!("http://{addr}/hooks/run"));

  let body = br#"{"status":"done","result":{"invoice":"INV-1"}}"#;
  let ts = Utc::now().timestamp().to_string();
  let signature = sign(SECRET, &ts, body).unwrap();
  let done = CallbackVerifier::new(fx.dyn_store(), 600)
    .handle(&task.key(), Some(ts.as_str()), Some(signature.as_str()), body, Utc::now())
    .await
    .unwrap();
  assert_eq!(done.status, TaskStatus::Done);
  assert_eq!(done.runtime.callback.unwrap().result, Some(json!({ "invoice": "INV-1" })));
}

#[tokio::test]
async fn webhook_error_status_fails_the_task() {
  let (addr, _received) = external_system(StatusCode::INTERNAL_SERVER_ERROR).await;
  let fx = Fixture::new().await;
  let task = fx.task_with(None, Some(fx.integration_id), 3).await;
  let url = format!("http://{addr}/hooks/run");
  let message = dispatch(&fx, &task, webhook(json!({ "url": url }))).await;

  let err = runtime(&fx).execute(&message).await.unwrap_err();

  assert!(matches!(err, TaskError::Execution(_)));
  let stored = fx.reload(&task.key()).await;
  assert_eq!(stored.status, TaskStatus::Failed);
  assert!(stored.last_error.unwrap().contains("500"));
  let job = fx.store.job_state(&message.handle).await.unwrap().unwrap();
  assert!(job.error.is_some());
}
