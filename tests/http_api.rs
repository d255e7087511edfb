mod common;

use chrono::Utc;
use common::{Fixture, SECRET, echo};
use serde_json::{Value, json};
use taskhub::callback::{SIGNATURE_HEADER, TIMESTAMP_HEADER, sign};
use taskhub::models::TaskStatus;
use taskhub::routes::routes;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::test::request;

fn body(res: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
  serde_json::from_slice(res.body()).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
  let fx = Fixture::new().await;
  let res = request().method("GET").path("/health").reply(&routes(fx.state())).await;
  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(body(&res)["status"], json!("ok"));
}

#[tokio::test]
async fn create_then_fetch_keeps_the_job_payload() {
  let fx = Fixture::new().await;
  let api = routes(fx.state());

  let res = request()
    .method("POST")
    .path("/companies/acme/projects/alpha/tasks")
    .json(&json!({ "title": "Nightly export", "job_type": "echo", "payload": { "message": "hi" } }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::CREATED);
  let created = body(&res);
  assert_eq!(created["status"], json!("queued"));
  assert_eq!(created["attempt_count"], json!(0));
  assert_eq!(created["project_code"], json!("alpha"));

  let id = created["id"].as_str().unwrap().to_string();
  let res = request().method("GET").path(&format!("/companies/acme/tasks/{id}")).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let fetched = body(&res);
  assert_eq!(fetched["runtime"]["job"]["job_type"], json!("echo"));
  assert_eq!(fetched["runtime"]["job"]["payload"]["message"], json!("hi"));

  let res = request().method("GET").path("/companies/acme/projects/alpha/tasks?limit=10").reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let page = body(&res);
  assert_eq!(page["items"].as_array().unwrap().len(), 1);
  assert_eq!(page["limit"], json!(10));
}

#[tokio::test]
async fn create_rejects_invalid_input() {
  let fx = Fixture::new().await;
  let api = routes(fx.state());

  let res = request()
    .method("POST")
    .path("/companies/acme/projects/alpha/tasks")
    .json(&json!({ "title": "hook", "job_type": "webhook", "payload": { "path": "/run" } }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
  assert_eq!(body(&res)["error"], json!("validation"));

  let res = request()
    .method("POST")
    .path("/companies/-acme/projects/alpha/tasks")
    .json(&json!({ "title": "t" }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::BAD_REQUEST);

  let res = request()
    .method("POST")
    .path("/companies/acme/projects/alpha/tasks")
    .header("content-type", "application/json")
    .body("{not json")
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

  let res = request()
    .method("POST")
    .path("/companies/nobody/projects/alpha/tasks")
    .json(&json!({ "title": "t" }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn listing_an_unknown_project_is_not_found() {
  let fx = Fixture::new().await;
  let res = request().method("GET").path("/companies/acme/projects/ghost/tasks").reply(&routes(fx.state())).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
  assert_eq!(body(&res)["error"], json!("not_found"));
}

#[tokio::test]
async fn run_reports_handle_and_status_starts_pending() {
  let fx = Fixture::new().await;
  let task = fx.task(None).await;
  let api = routes(fx.state());

  let res = request()
    .method("POST")
    .path(&format!("/companies/acme/projects/alpha/tasks/{}/run", task.id))
    .json(&json!({ "job_type": "long_demo", "payload": { "seconds": 3 } }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);
  let run = body(&res);
  assert_eq!(run["job"]["broker_task_name"], json!("taskhub.run_task"));
  assert_eq!(run["task"]["status"], json!("queued"));
  assert_eq!(run["task"]["attempt_count"], json!(1));
  let handle = run["job"]["broker_handle"].clone();

  let res = request().method("GET").path(&format!("/companies/acme/tasks/{}/status", task.id)).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let status = body(&res);
  assert_eq!(status["job"]["broker_handle"], handle);
  assert_eq!(status["job"]["state"], json!("PENDING"));

  let res = request()
    .method("POST")
    .path(&format!("/companies/acme/projects/alpha/tasks/{}/retry", task.id))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(body(&res)["task"]["previous_broker_handle"], handle);
}

#[tokio::test]
async fn bodyless_run_is_a_validation_error() {
  let fx = Fixture::new().await;
  let task = fx.task(None).await;
  let api = routes(fx.state());

  let res = request()
    .method("GET")
    .path(&format!("/companies/acme/projects/alpha/tasks/{}/run", task.id))
    .reply(&api)
    .await;

  assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
  assert_eq!(body(&res)["error"], json!("validation"));
  let stored = fx.reload(&task.key()).await;
  assert_eq!(stored.status, TaskStatus::Queued);
  assert_eq!(stored.attempt_count, 0);
  assert!(fx.broker.submitted().is_empty());
}

#[tokio::test]
async fn control_endpoints_flip_flags_only() {
  let fx = Fixture::new().await;
  let task = fx.task(Some(echo("x"))).await;
  let api = routes(fx.state());

  let res = request().method("POST").path(&format!("/companies/acme/tasks/{}/pause", task.id)).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(body(&res)["control"], json!({ "pause": true, "cancel": false }));

  let res = request().method("POST").path(&format!("/companies/acme/tasks/{}/cancel", task.id)).reply(&api).await;
  assert_eq!(body(&res)["control"], json!({ "pause": false, "cancel": true }));
  assert_eq!(fx.reload(&task.key()).await.status, TaskStatus::Queued);

  let res = request().method("POST").path(&format!("/companies/acme/tasks/{}/pause", Uuid::new_v4())).reply(&api).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn events_distinguish_missing_tasks_from_bad_limits() {
  let fx = Fixture::new().await;
  let task = fx.task(None).await;
  let api = routes(fx.state());

  let res = request().method("GET").path(&format!("/companies/acme/tasks/{}/events", task.id)).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let items = body(&res)["items"].as_array().unwrap().clone();
  assert_eq!(items.len(), 1);
  assert_eq!(items[0]["event_type"], json!("task_created"));

  let res = request().method("GET").path(&format!("/companies/acme/tasks/{}/events", Uuid::new_v4())).reply(&api).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);

  let res = request()
    .method("GET")
    .path(&format!("/companies/acme/tasks/{}/events?limit=0", task.id))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn nested_event_payloads_come_back_unchanged() {
  let fx = Fixture::new().await;
  let task = fx.task_with(None, Some(fx.integration_id), 3).await;
  let api = routes(fx.state());
  let payload = json!({
    "path": "/hooks/run",
    "body": {
      "lines": [{ "sku": "A-1", "qty": 2 }, { "sku": "B-7", "tags": ["fragile", null], "price": 12.5 }],
      "meta": { "nested": { "ok": true, "depth": [1, [2, [3]]] } },
    },
  });

  let res = request()
    .method("POST")
    .path(&format!("/companies/acme/projects/alpha/tasks/{}/run", task.id))
    .json(&json!({ "job_type": "webhook", "payload": payload }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);

  let res = request().method("GET").path(&format!("/companies/acme/tasks/{}/events", task.id)).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let items = body(&res)["items"].as_array().unwrap().clone();
  let requested = items.iter().find(|i| i["event_type"] == json!("run_requested")).unwrap();
  assert_eq!(requested["payload"], json!({ "job_type": "webhook", "job_payload": payload }));
}

#[tokio::test]
async fn callback_over_http_checks_signature_then_finishes_task() {
  let fx = Fixture::new().await;
  let task = fx.task_with(None, Some(fx.integration_id), 3).await;
  let api = routes(fx.state());
  let path = format!("/companies/acme/tasks/{}/callback", task.id);
  let payload = r#"{"status":"failed","error":"upstream rejected"}"#;

  let res = request().method("POST").path(&path).body(payload).reply(&api).await;
  assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

  let ts = Utc::now().timestamp().to_string();
  let res = request()
    .method("POST")
    .path(&path)
    .header(TIMESTAMP_HEADER, ts.as_str())
    .header(SIGNATURE_HEADER, sign("wrong-secret", &ts, payload.as_bytes()).unwrap())
    .body(payload)
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

  let res = request()
    .method("POST")
    .path(&path)
    .header(TIMESTAMP_HEADER, ts.as_str())
    .header(SIGNATURE_HEADER, sign(SECRET, &ts, payload.as_bytes()).unwrap())
    .body(payload)
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(body(&res)["status"], json!("failed"));
  assert_eq!(fx.reload(&task.key()).await.last_error.as_deref(), Some("upstream rejected"));
}

#[tokio::test]
async fn dependency_routes_cover_both_directions() {
  let fx = Fixture::new().await;
  let waiter = fx.task(None).await;
  let first = fx.task(None).await;
  let second = fx.task(None).await;
  let api = routes(fx.state());
  let path = format!("/companies/acme/tasks/{}/dependencies", waiter.id);

  let res = request()
    .method("POST")
    .path(&path)
    .json(&json!({ "dependee_task_ids": [first.id, second.id, Uuid::new_v4()] }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::CONFLICT);
  assert_eq!(fx.store.dependency_edges().await, 0);

  let res = request()
    .method("POST")
    .path(&path)
    .json(&json!({ "dependee_task_ids": [first.id, second.id] }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);

  let res = request().method("GET").path(&path).reply(&api).await;
  let ids: Vec<Value> = body(&res)["items"].as_array().unwrap().iter().map(|i| i["dependee_task_id"].clone()).collect();
  assert_eq!(ids, vec![json!(first.id), json!(second.id)]);

  let res = request()
    .method("GET")
    .path(&format!("/companies/acme/tasks/{}/dependents", first.id))
    .reply(&api)
    .await;
  let items = body(&res)["items"].as_array().unwrap().clone();
  assert_eq!(items.len(), 1);
  assert_eq!(items[0]["waiter_task_id"], json!(waiter.id));

  let res = request()
    .method("POST")
    .path(&path)
    .json(&json!({ "dependee_task_ids": ["not-a-uuid"] }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_routes_get_a_json_404() {
  let fx = Fixture::new().await;
  let res = request().method("GET").path("/nowhere").reply(&routes(fx.state())).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
  assert_eq!(body(&res)["error"], json!("not_found"));
}
