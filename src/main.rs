use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use taskhub::config::Config;
use taskhub::database::setup_database;
use taskhub::messaging::RabbitBroker;
use taskhub::routes::{AppState, routes};
use taskhub::store::PgTaskStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  taskhub::init_tracing();
  let config = Config::from_env().context("loading configuration")?;
  let db_pool = setup_database(&config.database_url).await.context("connecting to the database")?;
  let broker = RabbitBroker::connect(&config.rabbitmq_url, &config.broker.queue)
    .await
    .context("connecting to RabbitMQ")?;

  let state = AppState::new(Arc::new(PgTaskStore::new(db_pool)), Arc::new(broker), &config.api);
  let (addr, server) = warp::serve(routes(state)).bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async {
    let _ = tokio::signal::ctrl_c().await;
  });

  info!(%addr, "API listening");
  server.await;
  info!("API stopped");
  Ok(())
}
