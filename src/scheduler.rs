use std::sync::Arc;

use anyhow::Context;
use taskhub::config::Config;
use taskhub::database::setup_database;
use taskhub::dispatcher::Dispatcher;
use taskhub::messaging::RabbitBroker;
use taskhub::scheduler_loop::SchedulerLoop;
use taskhub::store::{PgTaskStore, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  taskhub::init_tracing();
  let config = Config::from_env().context("loading configuration")?;
  let db_pool = setup_database(&config.database_url).await.context("connecting to the database")?;
  let broker = RabbitBroker::connect(&config.rabbitmq_url, &config.broker.queue)
    .await
    .context("connecting to RabbitMQ")?;

  let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(db_pool));
  let dispatcher = Dispatcher::new(store.clone(), Arc::new(broker));
  let scheduler = SchedulerLoop::new(store, dispatcher, config.scheduler.clone());

  scheduler
    .run(async {
      let _ = tokio::signal::ctrl_c().await;
    })
    .await;
  Ok(())
}
