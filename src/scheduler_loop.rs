use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, instrument, warn};

use crate::config::SchedulerSettings;
use crate::dispatcher::Dispatcher;
use crate::error::TaskError;
use crate::store::TaskStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
  pub reserved: usize,
  pub dispatched: usize,
  pub failed: usize,
}

/// Periodically reserves queued tasks that carry a job and hands them to the dispatcher.
pub struct SchedulerLoop {
  store: Arc<dyn TaskStore>,
  dispatcher: Dispatcher,
  settings: SchedulerSettings,
}

impl SchedulerLoop {
  pub fn new(store: Arc<dyn TaskStore>, dispatcher: Dispatcher, settings: SchedulerSettings) -> Self {
    Self { store, dispatcher, settings }
  }

  /// One pass: phase A in a single transaction, then phases B and C per task
  /// with no lock held.
  #[instrument(skip(self))]
  pub async fn tick(&self) -> Result<TickReport, TaskError> {
    let reserved = self.store.reserve_dispatchable(self.settings.batch_size, Utc::now()).await?;
    let mut report = TickReport { reserved: reserved.len(), ..TickReport::default() };

    for task in reserved {
      let task_id = task.id;
      match self.dispatcher.dispatch_reserved(task).await {
        Ok(receipt) => {
          report.dispatched += 1;
          info!(task_id = %task_id, handle = %receipt.broker_handle, "dispatched");
        }
        Err(e) => {
          report.failed += 1;
          warn!(task_id = %task_id, error = %e, "dispatch failed");
        }
      }
    }
    Ok(report)
  }

  pub async fn run(&self, shutdown: impl Future<Output = ()>) {
    let mut ticker = interval(self.settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    info!(interval = ?self.settings.interval, batch_size = self.settings.batch_size, "scheduler started");
    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!("scheduler stopping");
          break;
        }
        _ = ticker.tick() => {
          match self.tick().await {
            Ok(report) if report.reserved > 0 => info!(?report, "tick complete"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "tick failed"),
          }
        }
      }
    }
  }
}
