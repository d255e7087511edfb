use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use taskhub::config::Config;
use taskhub::database::setup_database;
use taskhub::messaging::{JobMessage, create_rabbit_channel, declare_queue};
use taskhub::store::PgTaskStore;
use taskhub::worker_runtime::{Execution, WorkerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  taskhub::init_tracing();
  let config = Config::from_env().context("loading configuration")?;
  let db_pool = setup_database(&config.database_url).await.context("connecting to the database")?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url)
    .await
    .context("connecting to RabbitMQ")?;
  declare_queue(&rabbit_channel, &config.broker.queue).await.context("declaring the task queue")?;

  let concurrency = config.worker.concurrency;
  rabbit_channel
    .basic_qos(concurrency.min(u16::MAX as usize) as u16, BasicQosOptions::default())
    .await
    .context("setting prefetch")?;
  let mut consumer = rabbit_channel
    .basic_consume(
      &config.broker.queue,
      &config.worker.worker_id,
      BasicConsumeOptions::default(),
      FieldTable::default(),
    )
    .await
    .context("starting consumer")?;

  let runtime = Arc::new(WorkerRuntime::new(Arc::new(PgTaskStore::new(db_pool)), config.worker.clone())?);
  let semaphore = Arc::new(Semaphore::new(concurrency));
  info!(worker = %config.worker.worker_id, concurrency, queue = %config.broker.queue, "worker consuming");

  loop {
    let delivery = tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("worker stopping");
        break;
      }
      next = consumer.next() => match next {
        Some(Ok(delivery)) => delivery,
        Some(Err(e)) => {
          error!("Consumer error: {:?}", e);
          continue;
        }
        None => break,
      },
    };

    let message = match JobMessage::decode(&delivery.data) {
      Ok(message) => message,
      Err(e) => {
        error!("Failed to parse job message: {:?}", e);
        let _ = delivery.ack(BasicAckOptions::default()).await;
        continue;
      }
    };

    let permit = semaphore.clone().acquire_owned().await.context("worker semaphore closed")?;
    let runtime = runtime.clone();
    tokio::spawn(async move {
      match runtime.execute(&message).await {
        Ok(Execution::Skipped(reason)) => {
          warn!(handle = %message.handle, reason = %reason, "delivery skipped");
          let _ = delivery.ack(BasicAckOptions::default()).await;
        }
        Ok(outcome) => {
          info!(handle = %message.handle, ?outcome, "delivery processed");
          let _ = delivery.ack(BasicAckOptions::default()).await;
        }
        Err(e) => {
          error!(handle = %message.handle, error = %e, "delivery failed");
          let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
        }
      }
      drop(permit);
    });
  }

  Ok(())
}
