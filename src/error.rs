use thiserror::Error;
use warp::http::StatusCode;

#[derive(Debug, Error)]
pub enum TaskError {
  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("{0}")]
  Validation(String),

  #[error("{0} not found")]
  NotFound(&'static str),

  #[error("{0}")]
  Conflict(String),

  /// A broker delivery that another worker already claimed or that a newer dispatch replaced.
  #[error("duplicate delivery: {0}")]
  DuplicateDelivery(String),

  #[error("unauthorized: {0}")]
  Unauthorized(&'static str),

  #[error("broker enqueue failed: {0}")]
  Dispatch(String),

  #[error("job execution failed: {0}")]
  Execution(String),

  #[error("internal error: {0}")]
  Internal(String),

  #[error(transparent)]
  Database(#[from] sqlx::Error),

  #[error(transparent)]
  Serialization(#[from] serde_json::Error),
}

impl TaskError {
  pub fn conflict(message: impl Into<String>) -> Self {
    Self::Conflict(message.into())
  }

  pub fn status_code(&self) -> StatusCode {
    match self {
      Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
      Self::NotFound(_) => StatusCode::NOT_FOUND,
      Self::Conflict(_) | Self::DuplicateDelivery(_) => StatusCode::CONFLICT,
      Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
      Self::Dispatch(_)
      | Self::Execution(_)
      | Self::Internal(_)
      | Self::Database(_)
      | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Self::BadRequest(_) => "bad_request",
      Self::Validation(_) => "validation",
      Self::NotFound(_) => "not_found",
      Self::Conflict(_) | Self::DuplicateDelivery(_) => "conflict",
      Self::Unauthorized(_) => "unauthorized",
      Self::Dispatch(_) => "dispatch_failed",
      Self::Execution(_) => "execution_failed",
      Self::Internal(_) | Self::Database(_) | Self::Serialization(_) => "internal",
    }
  }

  /// Message safe to hand back to an HTTP caller.
  pub fn public_detail(&self) -> String {
    match self {
      Self::Database(_) | Self::Serialization(_) | Self::Internal(_) => "internal server error".to_string(),
      other => other.to_string(),
    }
  }
}

impl warp::reject::Reject for TaskError {}
