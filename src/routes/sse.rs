use std::convert::Infallible;

use futures::StreamExt;
use futures::future::ready;
use serde_json::json;
use tokio_stream::wrappers::IntervalStream;
use tracing::warn;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use super::{AppState, reject, task_key, with_state};
use crate::error::TaskError;
use crate::models::{ControlFlags, Task, TaskStatus};

/// Decides which polled snapshots are worth sending.
#[derive(Debug, Default)]
pub struct StreamCursor {
  last: Option<(TaskStatus, ControlFlags)>,
  finished: bool,
}

impl StreamCursor {
  /// Returns the payload to emit, if the snapshot differs from the last one sent.
  pub fn next_payload(&mut self, task: &Task) -> Option<serde_json::Value> {
    if self.finished {
      return None;
    }
    let current = (task.status, task.control);
    if self.last == Some(current) {
      return None;
    }
    self.last = Some(current);
    self.finished = task.status.is_terminal();
    Some(json!({
      "task_id": task.id,
      "status": task.status,
      "attempt_count": task.attempt_count,
      "control": task.control,
    }))
  }

  pub fn is_finished(&self) -> bool {
    self.finished
  }
}

pub fn route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("companies" / String / "tasks" / String / "stream")
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_stream)
}

async fn handle_stream(company: String, task_id: String, state: AppState) -> Result<impl Reply, Rejection> {
  let key = task_key(&company, &task_id).map_err(reject)?;
  if state.store.get_task(&key).await.map_err(reject)?.is_none() {
    return Err(reject(TaskError::NotFound("task")));
  }

  let store = state.store.clone();
  let polls = IntervalStream::new(tokio::time::interval(state.stream_poll)).then(move |_| {
    let store = store.clone();
    let key = key.clone();
    async move {
      match store.get_task(&key).await {
        Ok(task) => task,
        Err(e) => {
          warn!(task = %key, error = %e, "stream poll failed");
          None
        }
      }
    }
  });

  // The stream ends once a terminal status has been sent or the task disappears.
  let stream = polls
    .take_while(|task| ready(task.is_some()))
    .scan(StreamCursor::default(), |cursor, task| {
      if cursor.is_finished() {
        return ready(None);
      }
      ready(Some(task.and_then(|t| cursor.next_payload(&t))))
    })
    .filter_map(|payload| ready(payload.map(|p| Ok::<Event, Infallible>(Event::default().event("status").data(p.to_string())))));

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
