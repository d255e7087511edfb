//! Signed completion callbacks from external systems.
//!
//! The signature is the lower-case hex HMAC-SHA256 of `"{timestamp}." + body`
//! under the integration's callback secret.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, instrument, warn};

use crate::error::TaskError;
use crate::models::{CallbackStatus, Task, TaskKey};
use crate::state_machine::{CallbackOutcome, apply_callback};
use crate::store::TaskStore;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
  pub status: CallbackStatus,
  #[serde(default)]
  pub result: Option<Value>,
  #[serde(default)]
  pub error: Option<String>,
}

fn mac_for(secret: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, TaskError> {
  let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| TaskError::Internal(e.to_string()))?;
  mac.update(timestamp.as_bytes());
  mac.update(b".");
  mac.update(body);
  Ok(mac)
}

pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> Result<String, TaskError> {
  Ok(hex::encode(mac_for(secret, timestamp, body)?.finalize().into_bytes()))
}

/// Constant-time comparison of `signature` against the expected MAC.
pub fn verify_signature(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> Result<(), TaskError> {
  let provided = hex::decode(signature.trim()).map_err(|_| TaskError::Unauthorized("invalid signature"))?;
  mac_for(secret, timestamp, body)?
    .verify_slice(&provided)
    .map_err(|_| TaskError::Unauthorized("invalid signature"))
}

pub fn check_timestamp(timestamp: &str, now: DateTime<Utc>, tolerance_secs: i64) -> Result<(), TaskError> {
  let ts: i64 = timestamp.trim().parse().map_err(|_| TaskError::Unauthorized("invalid timestamp"))?;
  if (now.timestamp() - ts).abs() > tolerance_secs {
    return Err(TaskError::Unauthorized("timestamp outside tolerance window"));
  }
  Ok(())
}

#[derive(Clone)]
pub struct CallbackVerifier {
  store: Arc<dyn TaskStore>,
  tolerance_secs: i64,
}

impl CallbackVerifier {
  pub fn new(store: Arc<dyn TaskStore>, tolerance_secs: i64) -> Self {
    Self { store, tolerance_secs }
  }

  #[instrument(skip_all, fields(task = %key))]
  pub async fn handle(
    &self,
    key: &TaskKey,
    timestamp: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    now: DateTime<Utc>,
  ) -> Result<Task, TaskError> {
    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
      return Err(TaskError::Unauthorized("missing signature headers"));
    };
    check_timestamp(timestamp, now, self.tolerance_secs)?;

    let task = self.store.get_task(key).await?.ok_or(TaskError::NotFound("task"))?;
    let integration_id = task.integration_id.ok_or(TaskError::Unauthorized("task has no integration"))?;
    let integration = self
      .store
      .integration(task.company_id, integration_id)
      .await?
      .filter(|i| i.is_active)
      .ok_or(TaskError::Unauthorized("integration not available"))?;
    let secret = integration.callback_secret().ok_or(TaskError::Unauthorized("integration has no callback secret"))?;

    if let Err(e) = verify_signature(secret, timestamp, body, signature) {
      warn!("callback signature rejected");
      return Err(e);
    }

    let payload: CallbackPayload =
      serde_json::from_slice(body).map_err(|e| TaskError::Validation(format!("invalid callback body: {e}")))?;
    let outcome = CallbackOutcome {
      status: payload.status,
      result: payload.result,
      error: payload.error,
      raw_body: String::from_utf8_lossy(body).into_owned(),
    };
    let task = self
      .store
      .mutate_task(key, Box::new(move |task: &mut Task| apply_callback(task, outcome, now)))
      .await?;
    info!(status = %task.status, "callback applied");
    Ok(task)
  }
}
