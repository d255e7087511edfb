use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("missing required environment variable {0}")]
  Missing(&'static str),

  #[error("invalid value for {name}: {value:?}")]
  Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub broker: BrokerSettings,
  pub api: ApiSettings,
  pub worker: WorkerSettings,
  pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
  pub queue: String,
}

impl Default for BrokerSettings {
  fn default() -> Self {
    Self { queue: "task_queue".into() }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
  /// Accepted clock skew for signed callbacks, in seconds.
  pub callback_tolerance_secs: i64,
  pub stream_poll: Duration,
}

impl Default for ApiSettings {
  fn default() -> Self {
    Self {
      callback_tolerance_secs: 600,
      stream_poll: Duration::from_secs(2),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
  pub worker_id: String,
  pub concurrency: usize,
  pub pause_poll: Duration,
  pub work_unit: Duration,
  /// Heartbeat is rewritten every N completed work units.
  pub heartbeat_every: u64,
  pub webhook_timeout: Duration,
  /// Public API base used to build callback URLs for webhook jobs.
  pub callback_base_url: String,
}

impl Default for WorkerSettings {
  fn default() -> Self {
    Self {
      worker_id: "worker-1".into(),
      concurrency: 4,
      pause_poll: Duration::from_secs(1),
      work_unit: Duration::from_secs(1),
      heartbeat_every: 5,
      webhook_timeout: Duration::from_secs(10),
      callback_base_url: "http://localhost:8080".into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
  pub interval: Duration,
  pub batch_size: usize,
}

impl Default for SchedulerSettings {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(3),
      batch_size: 25,
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|name| env::var(name).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
    let server_port: u16 = parsed(&lookup, "SERVER_PORT", 8080)?;
    let public_base_url = lookup("PUBLIC_BASE_URL")
      .unwrap_or_else(|| format!("http://localhost:{server_port}"))
      .trim_end_matches('/')
      .to_string();

    let worker_defaults = WorkerSettings::default();
    let concurrency: usize = parsed(&lookup, "WORKER_CONCURRENCY", worker_defaults.concurrency)?;
    if concurrency == 0 {
      return Err(ConfigError::Invalid { name: "WORKER_CONCURRENCY", value: "0".into() });
    }
    let batch_size: usize = parsed(&lookup, "SCHEDULER_BATCH_SIZE", SchedulerSettings::default().batch_size)?;
    if batch_size == 0 {
      return Err(ConfigError::Invalid { name: "SCHEDULER_BATCH_SIZE", value: "0".into() });
    }

    Ok(Self {
      database_url: required(&lookup, "DATABASE_URL")?,
      rabbitmq_url: required(&lookup, "RABBITMQ_URL")?,
      server_port,
      broker: BrokerSettings {
        queue: lookup("TASK_QUEUE").unwrap_or_else(|| BrokerSettings::default().queue),
      },
      api: ApiSettings {
        callback_tolerance_secs: parsed(&lookup, "CALLBACK_TOLERANCE_SECS", 600)?,
        ..ApiSettings::default()
      },
      worker: WorkerSettings {
        worker_id: lookup("WORKER_ID").unwrap_or(worker_defaults.worker_id),
        concurrency,
        pause_poll: Duration::from_millis(parsed(&lookup, "PAUSE_POLL_MS", 1000)?),
        work_unit: worker_defaults.work_unit,
        heartbeat_every: parsed::<u64>(&lookup, "HEARTBEAT_EVERY", 5)?.max(1),
        webhook_timeout: Duration::from_secs(parsed(&lookup, "WEBHOOK_TIMEOUT_SECS", 10)?),
        callback_base_url: public_base_url,
      },
      scheduler: SchedulerSettings {
        interval: Duration::from_secs(parsed(&lookup, "SCHEDULER_INTERVAL_SECS", 3)?),
        batch_size,
      },
    })
  }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
  lookup(name).filter(|v| !v.is_empty()).ok_or(ConfigError::Missing(name))
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError> {
  match lookup(name) {
    None => Ok(default),
    Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
  }
}
