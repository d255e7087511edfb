//! Task Store, Event Log, dependency edges and the broker result backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::TaskError;
use crate::events::{NewEvent, TaskEvent};
use crate::models::{ControlFlags, DependencyView, Integration, JobState, NewTask, Page, Task, TaskKey};

pub mod memory;
pub mod postgres;

pub use memory::MemoryTaskStore;
pub use postgres::PgTaskStore;

/// Patch applied to a locked task. The returned events are appended in the
/// same transaction; an `Err` rolls the whole mutation back.
pub type Mutation = Box<dyn FnOnce(&mut Task) -> Result<Vec<NewEvent>, TaskError> + Send>;

#[async_trait]
pub trait TaskStore: Send + Sync {
  async fn company_id(&self, company_code: &str) -> Result<Option<Uuid>, TaskError>;

  async fn project_id(&self, company_id: Uuid, project_code: &str) -> Result<Option<Uuid>, TaskError>;

  async fn integration(&self, company_id: Uuid, integration_id: Uuid) -> Result<Option<Integration>, TaskError>;

  async fn create_task(&self, task: NewTask, created: NewEvent) -> Result<Task, TaskError>;

  async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>, TaskError>;

  /// Newest first.
  async fn list_tasks(&self, company_id: Uuid, project_id: Uuid, page: Page) -> Result<Vec<Task>, TaskError>;

  /// Locks the row, applies `mutation` and persists the task together with its events.
  async fn mutate_task(&self, key: &TaskKey, mutation: Mutation) -> Result<Task, TaskError>;

  /// Selects up to `limit` dispatch candidates oldest first, skipping rows
  /// locked elsewhere, and reserves each one in the same transaction.
  async fn reserve_dispatchable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError>;

  async fn read_control(&self, key: &TaskKey) -> Result<Option<ControlFlags>, TaskError>;

  /// Inserts every edge or none. Returns the number of new edges.
  async fn add_dependencies(&self, waiter: &TaskKey, dependees: &[Uuid], event: NewEvent) -> Result<u64, TaskError>;

  async fn list_dependencies(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError>;

  async fn list_dependents(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError>;

  async fn list_events(&self, key: &TaskKey, limit: i64) -> Result<Vec<TaskEvent>, TaskError>;

  async fn record_job_state(&self, state: &JobState) -> Result<(), TaskError>;

  async fn job_state(&self, handle: &str) -> Result<Option<JobState>, TaskError>;
}

/// Ids from `requested` with no matching task, in request order.
pub fn missing_ids(requested: &[Uuid], found: &[Uuid]) -> Vec<Uuid> {
  requested.iter().filter(|id| !found.contains(id)).copied().collect()
}

pub(crate) fn join_ids(ids: &[Uuid]) -> String {
  ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(", ")
}
