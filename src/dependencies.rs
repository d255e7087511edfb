//! Dependency edges between tasks of one tenant. Advisory only: nothing in
//! dispatch consults them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::TaskError;
use crate::events::{EventKind, NewEvent};
use crate::models::{DependencyView, TaskKey};
use crate::store::TaskStore;

/// Parses and de-duplicates dependee ids, keeping request order.
pub fn parse_dependee_ids(raw: &[String]) -> Result<Vec<Uuid>, TaskError> {
  if raw.is_empty() {
    return Err(TaskError::Validation("dependee_task_ids must not be empty".into()));
  }
  let mut seen = HashSet::new();
  let mut ids = Vec::with_capacity(raw.len());
  for value in raw {
    let id = Uuid::parse_str(value.trim()).map_err(|_| TaskError::BadRequest(format!("invalid task id '{value}'")))?;
    if seen.insert(id) {
      ids.push(id);
    }
  }
  Ok(ids)
}

#[derive(Clone)]
pub struct DependencyGraph {
  store: Arc<dyn TaskStore>,
}

impl DependencyGraph {
  pub fn new(store: Arc<dyn TaskStore>) -> Self {
    Self { store }
  }

  pub async fn add(&self, waiter: &TaskKey, dependees: &[Uuid]) -> Result<u64, TaskError> {
    let event = NewEvent::user(EventKind::DependenciesAdded, Utc::now(), json!({ "dependee_task_ids": dependees }));
    let inserted = self.store.add_dependencies(waiter, dependees, event).await?;
    info!(task = %waiter, requested = dependees.len(), inserted, "dependencies added");
    Ok(inserted)
  }

  pub async fn dependencies(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError> {
    self.ensure_exists(key).await?;
    self.store.list_dependencies(key).await
  }

  pub async fn dependents(&self, key: &TaskKey) -> Result<Vec<DependencyView>, TaskError> {
    self.ensure_exists(key).await?;
    self.store.list_dependents(key).await
  }

  async fn ensure_exists(&self, key: &TaskKey) -> Result<(), TaskError> {
    match self.store.get_task(key).await? {
      Some(_) => Ok(()),
      None => Err(TaskError::NotFound("task")),
    }
  }
}
