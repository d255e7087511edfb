use std::sync::Mutex;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{DispatchTarget, TaskKey};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

#[derive(Debug, Error)]
pub enum BrokerError {
  #[error("amqp error: {0}")]
  Amqp(#[from] lapin::Error),

  #[error("could not encode job message: {0}")]
  Encode(#[from] serde_json::Error),

  #[error("broker unavailable: {0}")]
  Unavailable(String),

  #[error("malformed job message: {0}")]
  Malformed(String),
}

/// Envelope published for every dispatch. `args` is `[company_code, task_id]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
  pub handle: String,
  pub name: String,
  pub args: Vec<String>,
  #[serde(default)]
  pub kwargs: Map<String, Value>,
}

impl JobMessage {
  pub fn new(handle: String, target: &DispatchTarget) -> Self {
    Self {
      handle,
      name: target.name.clone(),
      args: target.args.clone(),
      kwargs: target.kwargs.clone(),
    }
  }

  pub fn decode(data: &[u8]) -> Result<Self, BrokerError> {
    Ok(serde_json::from_slice(data)?)
  }

  pub fn task_key(&self) -> Result<TaskKey, BrokerError> {
    match self.args.as_slice() {
      [company_code, task_id] => {
        let task_id = Uuid::parse_str(task_id).map_err(|e| BrokerError::Malformed(format!("task id: {e}")))?;
        Ok(TaskKey::new(company_code.clone(), task_id))
      }
      other => Err(BrokerError::Malformed(format!("expected 2 args, got {}", other.len()))),
    }
  }
}

/// Hands job specifications to the worker pool and returns the broker handle.
#[async_trait]
pub trait Broker: Send + Sync {
  async fn submit(&self, target: &DispatchTarget) -> Result<String, BrokerError>;
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel, BrokerError> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
  .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), BrokerError> {
  channel
    .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
    .await?;
  Ok(())
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8], message_id: &str) -> Result<(), BrokerError> {
  let properties = BasicProperties::default()
    .with_message_id(message_id.into())
    .with_content_type("application/json".into())
    .with_delivery_mode(2);
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel
      .basic_publish("", queue, BasicPublishOptions::default(), payload, properties.clone())
      .await?
      .await
  })
  .await?;
  Ok(())
}

pub struct RabbitBroker {
  channel: Channel,
  queue: String,
}

impl RabbitBroker {
  pub async fn connect(rabbitmq_url: &str, queue: &str) -> Result<Self, BrokerError> {
    let channel = create_rabbit_channel(rabbitmq_url).await?;
    declare_queue(&channel, queue).await?;
    Ok(Self { channel, queue: queue.to_string() })
  }
}

#[async_trait]
impl Broker for RabbitBroker {
  async fn submit(&self, target: &DispatchTarget) -> Result<String, BrokerError> {
    let handle = Uuid::new_v4().to_string();
    let message = JobMessage::new(handle.clone(), target);
    let payload = serde_json::to_vec(&message)?;
    publish_message(&self.channel, &self.queue, &payload, &handle).await?;
    debug!(handle = %handle, name = %message.name, "job published");
    Ok(handle)
  }
}

/// Broker that keeps submitted messages in memory.
#[derive(Default)]
pub struct MemoryBroker {
  submitted: Mutex<Vec<JobMessage>>,
  failing: Mutex<bool>,
}

impl MemoryBroker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_failing(&self, failing: bool) {
    if let Ok(mut flag) = self.failing.lock() {
      *flag = failing;
    }
  }

  pub fn submitted(&self) -> Vec<JobMessage> {
    self.submitted.lock().map(|m| m.clone()).unwrap_or_default()
  }
}

#[async_trait]
impl Broker for MemoryBroker {
  async fn submit(&self, target: &DispatchTarget) -> Result<String, BrokerError> {
    let failing = self.failing.lock().map(|f| *f).unwrap_or(false);
    if failing {
      return Err(BrokerError::Unavailable("connection refused".into()));
    }
    let handle = Uuid::new_v4().to_string();
    let message = JobMessage::new(handle.clone(), target);
    self
      .submitted
      .lock()
      .map_err(|_| BrokerError::Unavailable("memory broker poisoned".into()))?
      .push(message);
    Ok(handle)
  }
}
