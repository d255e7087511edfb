use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::TaskError;
use crate::events::{NewEvent, TaskEvent};
use crate::models::{
  ControlFlags, DependencyView, Integration, IntegrationConfig, IntegrationSecret, JobState, NewTask, Page, Runtime,
  Task, TaskKey, TaskStatus,
};
use crate::state_machine::{is_dispatch_candidate, reserve_for_dispatch};
use crate::store::{Mutation, TaskStore, join_ids, missing_ids};

/// Process-local store with the same transactional behaviour as Postgres:
/// one lock serializes every operation and a failed mutation leaves no trace.
#[derive(Default)]
pub struct MemoryTaskStore {
  inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
  companies: HashMap<Uuid, String>,
  projects: HashMap<Uuid, (Uuid, String)>,
  integrations: HashMap<Uuid, Integration>,
  // insertion order doubles as created_at order
  tasks: Vec<Task>,
  events: Vec<TaskEvent>,
  edges: Vec<(Uuid, Uuid)>,
  jobs: HashMap<String, JobState>,
}

impl Inner {
  fn position(&self, key: &TaskKey) -> Option<usize> {
    self.tasks.iter().position(|t| t.id == key.task_id && t.company_code == key.company_code)
  }

  fn append(&mut self, task: &Task, events: Vec<NewEvent>) {
    for event in events {
      let id = self.events.len() as i64 + 1;
      self.events.push(TaskEvent {
        id,
        task_id: task.id,
        company_id: task.company_id,
        event_type: event.kind.as_str().to_string(),
        actor_type: event.actor,
        payload: event.payload,
        created_at: event.at,
      });
    }
  }

  fn view(&self, id: Uuid) -> Option<(usize, DependencyView)> {
    let index = self.tasks.iter().position(|t| t.id == id)?;
    let task = &self.tasks[index];
    Some((
      index,
      DependencyView {
        task_id: task.id,
        title: task.title.clone(),
        status: task.status,
        runtime: task.runtime.clone(),
        control: task.control,
        created_at: task.created_at,
      },
    ))
  }

  fn views(&self, ids: impl Iterator<Item = Uuid>) -> Vec<DependencyView> {
    let mut found: Vec<(usize, DependencyView)> = ids.filter_map(|id| self.view(id)).collect();
    found.sort_by_key(|(index, _)| *index);
    found.into_iter().map(|(_, view)| view).collect()
  }
}

impl MemoryTaskStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn add_company(&self, code: &str) -> Uuid {
    let id = Uuid::new_v4();
    self.inner.lock().await.companies.insert(id, code.to_string());
    id
  }

  pub async fn add_project(&self, company_id: Uuid, code: &str) -> Uuid {
    let id = Uuid::new_v4();
    self.inner.lock().await.projects.insert(id, (company_id, code.to_string()));
    id
  }

  pub async fn add_integration(
    &self,
    company_id: Uuid,
    provider_code: &str,
    base_url: Option<&str>,
    callback_secret: Option<&str>,
  ) -> Uuid {
    let id = Uuid::new_v4();
    let integration = Integration {
      id,
      company_id,
      provider_code: provider_code.to_string(),
      is_active: true,
      config: IntegrationConfig { base_url: base_url.map(str::to_string) },
      secret: IntegrationSecret { callback_secret: callback_secret.map(str::to_string) },
    };
    self.inner.lock().await.integrations.insert(id, integration);
    id
  }

  pub async fn dependency_edges(&self) -> usize {
    self.inner.lock().await.edges.len()
  }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
  async fn company_id(&self, company_code: &str) -> Result<Option<Uuid>, TaskError> {
    let inner = self.inner.lock().await;
    Ok(inner.companies.iter().find(|(_, code)| code.as_str() == company_code).map(|(id, _)| *id))
  }

  async fn project_id(&self, company_id: Uuid, project_code: &str) -> Result<Option<Uuid>, TaskError> {
    let inner = self.inner.lock().await;
    Ok(
      inner
        .projects
        .iter()
        .find(|(_, (owner, code))| *owner == company_id && code == project_code)
        .map(|(id, _)| *id),
    )
  }

  async fn integration(&self, company_id: Uuid, integration_id: Uuid) -> Result<Option<Integration>, TaskError> {
    let inner = self.inner.lock().await;
    Ok(inner.integrations.get(&integration_id).filter(|i| i.company_id == company_id).cloned())
  }

  async fn create_task(&self, new: NewTask, created: NewEvent) -> Result<Task, TaskError> {
    let mut inner = self.inner.lock().await;
    let company_code = inner.companies.get(&new.company_id).cloned().ok_or(TaskError::NotFound("company"))?;
    let project_code = match new.project_id {
      Some(id) => Some(inner.projects.get(&id).map(|(_, code)| code.clone()).ok_or(TaskError::NotFound("project"))?),
      None => None,
    };

    let now = Utc::now();
    let task = Task {
      id: Uuid::new_v4(),
      company_id: new.company_id,
      company_code,
      project_id: new.project_id,
      project_code,
      integration_id: new.integration_id,
      title: new.title,
      status: TaskStatus::Queued,
      priority: new.priority,
      attempt_count: 0,
      max_attempts: new.max_attempts,
      control: ControlFlags::default(),
      runtime: Runtime::with_job(new.job),
      last_error: None,
      deadline_at: new.deadline_at,
      last_heartbeat_at: None,
      created_at: now,
      updated_at: now,
    };
    inner.append(&task, vec![created]);
    inner.tasks.push(task.clone());
    Ok(task)
  }

  async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>, TaskError> {
    let inner = self.inner.lock().await;
    Ok(inner.position(key).map(|i| inner.tasks[i].clone()))
  }

  async fn list_tasks(&self, company_id: Uuid, project_id: Uuid, page: Page) -> Result<Vec<Task>, TaskError> {
    let inner = self.inner.lock().await;
    Ok(
      inner
        .tasks
        .iter()
        .rev()
        .filter(|t| t.company_id == company_id && t.project_id == Some(project_id))
        .skip(page.offset.max(0) as usize)
        .take(page.limit.max(0) as usize)
        .cloned()
        .collect(),
    )
  }

  async fn mutate_task(&self, key: &TaskKey, mutation: Mutation) -> Result<Task, TaskError> {
    let mut inner = self.inner.lock().await;
    let index = inner.position(key).ok_or(TaskError::NotFound("task"))?;
    let mut task = inner.tasks[index].clone();
    let events = mutation(&mut task)?;
    task.updated_at = Utc::now();
    inner.append(&task, events);
    inner.tasks[index] = task.clone();
    Ok(task)
  }

  async fn reserve_dispatchable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError> {
    let mut inner = self.inner.lock().await;
    let candidates: Vec<usize> = (0..inner.tasks.len())
      .filter(|&i| is_dispatch_candidate(&inner.tasks[i]))
      .take(limit)
      .collect();

    let mut reserved = Vec::with_capacity(candidates.len());
    for index in candidates {
      let mut task = inner.tasks[index].clone();
      let events = reserve_for_dispatch(&mut task, now)?;
      task.updated_at = now;
      inner.append(&task, events);
      inner.tasks[index] = task.clone();
      reserved.push(task);
    }
    Ok(reserved)
  }

  async fn read_control(&self, key: &TaskKey) -> Result<Option<ControlFlags>, TaskError> {
    let inner = self.inner.lock().await;
    Ok(inner.position(key).map(|i| inner.tasks[i].control))
  }

  async fn add_dependencies(&self, waiter: &TaskKey, dependees: &[Uuid], event: NewEvent) -> Result<u64, TaskError> {
    let mut inner = self.inner.lock().await;
    let index = inner.position(waiter).ok_or(TaskError::NotFound("task"))?;
    let company_id = inner.tasks[index].company_id;

    let found: Vec<Uuid> = inner
      .tasks
      .iter()
      .filter(|t| t.company_id == company_id && dependees.contains(&t.id))
      .map(|t| t.id)
      .collect();
    let missing = missing_ids(dependees, &found);
    if !missing.is_empty() {
      return Err(TaskError::conflict(format!("unknown dependee tasks: {}", join_ids(&missing))));
    }

    let existing: HashSet<(Uuid, Uuid)> = inner.edges.iter().copied().collect();
    let mut inserted = 0;
    for dependee in dependees {
      let edge = (waiter.task_id, *dependee);
      if !existing.contains(&edge) {
        inner.edges.push(edge);
        inserted += 1;
      }
    }
    let task = inner.tasks[index].clone();
    inner.append(&task, vec![event]);
    Ok(inserted)
  }

  async fn list_dependencies(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError> {
    let inner = self.inner.lock().await;
    let ids: Vec<Uuid> = inner.edges.iter().filter(|(w, _)| *w == key.task_id).map(|(_, d)| *d).collect();
    Ok(inner.views(ids.into_iter()))
  }

  async fn list_dependents(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError> {
    let inner = self.inner.lock().await;
    let ids: Vec<Uuid> = inner.edges.iter().filter(|(_, d)| *d == key.task_id).map(|(w, _)| *w).collect();
    Ok(inner.views(ids.into_iter()))
  }

  async fn list_events(&self, key: &TaskKey, limit: i64) -> Result<Vec<TaskEvent>, TaskError> {
    let inner = self.inner.lock().await;
    let Some(index) = inner.position(key) else {
      return Ok(Vec::new());
    };
    let task_id = inner.tasks[index].id;
    Ok(
      inner
        .events
        .iter()
        .filter(|e| e.task_id == task_id)
        .take(limit.max(0) as usize)
        .cloned()
        .collect(),
    )
  }

  async fn record_job_state(&self, state: &JobState) -> Result<(), TaskError> {
    self.inner.lock().await.jobs.insert(state.handle.clone(), state.clone());
    Ok(())
  }

  async fn job_state(&self, handle: &str) -> Result<Option<JobState>, TaskError> {
    Ok(self.inner.lock().await.jobs.get(handle).cloned())
  }
}
