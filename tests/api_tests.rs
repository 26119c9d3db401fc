//! HTTP routes exercised with `tower::ServiceExt::oneshot`, no socket needed.

mod test_harness;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use bucket_queue::server::api;
use test_harness::{test_config, test_server};

fn app() -> Router {
    api::router(test_server(test_config()))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn schedule_body(job_id: &str, request_id: &str, tests: &[(&str, &str)]) -> Value {
    json!({
        "prioritized_job": {
            "job_id": job_id,
            "job_group_id": "group",
            "job_priority": 500,
            "job_group_priority": 500
        },
        "schedule_strategy": { "type": "individual" },
        "test_entry_configurations": tests
            .iter()
            .map(|(class_name, method_name)| json!({
                "test_entry": { "class_name": class_name, "method_name": method_name }
            }))
            .collect::<Vec<_>>(),
        "request_id": request_id
    })
}

#[tokio::test]
async fn test_schedule_dequeue_report_flow() {
    let app = app();

    let (status, scheduled) = send(
        &app,
        "POST",
        "/api/jobs",
        Some(schedule_body("J", "r1", &[("Login", "testLogin")])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scheduled["enqueued"], true);
    assert_eq!(scheduled["bucket_ids"].as_array().unwrap().len(), 1);

    let (status, config) = send(
        &app,
        "POST",
        "/api/workers/register",
        Some(json!({ "worker_id": "w1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(config["report_alive_interval_ms"].as_u64().unwrap() > 0);

    let (status, dequeued) = send(
        &app,
        "POST",
        "/api/workers/dequeue",
        Some(json!({ "worker_id": "w1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dequeued["type"], "dequeued");
    let bucket_id = dequeued["bucket"]["enqueued"]["bucket"]["bucket_id"].clone();
    assert_eq!(bucket_id, scheduled["bucket_ids"][0]);

    let (status, _) = send(
        &app,
        "POST",
        "/api/workers/alive",
        Some(json!({ "worker_id": "w1", "bucket_ids_being_processed": [bucket_id] })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, outcome) = send(
        &app,
        "POST",
        "/api/workers/result",
        Some(json!({
            "worker_id": "w1",
            "testing_result": {
                "bucket_id": bucket_id,
                "results": [{
                    "test_entry": { "class_name": "Login", "method_name": "testLogin" },
                    "outcome": "passed",
                    "duration_ms": 12
                }]
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome, json!({ "type": "accepted", "retried_entries": 0 }));

    let (status, state) = send(&app, "GET", "/api/jobs/J/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["type"], "running");
    assert_eq!(state["is_depleted"], true);

    let (status, results) = send(&app, "GET", "/api/jobs/J/results", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results["testing_results"][0]["results"][0]["outcome"], "passed");
}

#[tokio::test]
async fn test_duplicate_request_id_enqueues_nothing() {
    let app = app();
    let body = schedule_body("J", "same-request", &[("A", "a")]);

    let (_, first) = send(&app, "POST", "/api/jobs", Some(body.clone())).await;
    let (status, second) = send(&app, "POST", "/api/jobs", Some(body)).await;

    assert_eq!(first["enqueued"], true);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["enqueued"], false);
    let (_, queue) = send(&app, "GET", "/api/queue", None).await;
    assert_eq!(queue["enqueued_buckets"], 1);
}

#[tokio::test]
async fn test_empty_schedule_request_is_bad_request() {
    let app = app();
    let (status, body) = send(&app, "POST", "/api/jobs", Some(schedule_body("J", "r", &[]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("no test entries"));
}

#[tokio::test]
async fn test_out_of_range_priority_is_rejected() {
    let app = app();
    let mut body = schedule_body("J", "r", &[("A", "a")]);
    body["prioritized_job"]["job_priority"] = json!(1000);
    let (status, _) = send(&app, "POST", "/api/jobs", Some(body)).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let app = app();
    let (status, body) = send(&app, "GET", "/api/jobs/nope/state", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = send(&app, "DELETE", "/api/jobs/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deleted_job_reports_deleted_state_and_refuses_new_tests() {
    let app = app();
    send(&app, "POST", "/api/jobs", Some(schedule_body("J", "r1", &[("A", "a")]))).await;

    let (status, _) = send(&app, "DELETE", "/api/jobs/J", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, state) = send(&app, "GET", "/api/jobs/J/state", None).await;
    assert_eq!(state, json!({ "type": "deleted" }));

    let (status, _) = send(&app, "POST", "/api/jobs", Some(schedule_body("J", "r2", &[("A", "b")]))).await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_blocked_worker_is_forbidden() {
    let app = app();
    let (status, _) = send(&app, "POST", "/api/workers/w9/block", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        "POST",
        "/api/workers/dequeue",
        Some(json!({ "worker_id": "w9" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        "POST",
        "/api/workers/alive",
        Some(json!({ "worker_id": "w9" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, workers) = send(&app, "GET", "/api/workers", None).await;
    assert_eq!(workers[0]["worker_id"], "w9");
    assert_eq!(workers[0]["status"], "blocked");
}

#[tokio::test]
async fn test_empty_queue_says_check_again_later() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/workers/dequeue",
        Some(json!({ "worker_id": "w1", "capabilities": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "check_again_later");
    assert_eq!(body["check_after_ms"], 50);
}
