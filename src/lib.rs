pub mod callback;
pub mod config;
pub mod control;
pub mod database;
pub mod dependencies;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod messaging;
pub mod models;
pub mod routes;
pub mod scheduler_loop;
pub mod state_machine;
pub mod store;
pub mod worker_processing;
pub mod worker_runtime;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber; `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
