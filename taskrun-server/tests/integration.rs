use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use taskrun_core::config::EngineConfig;
use taskrun_core::engine::TaskEngine;
use taskrun_core::gateway::StaticGateway;
use taskrun_core::store::MemoryTaskRegistry;
use taskrun_core::store_memory::MemoryRunStore;
use taskrun_server::routes::create_router;
use tower::ServiceExt;

fn engine_with(gateway: StaticGateway) -> Arc<TaskEngine> {
    Arc::new(TaskEngine::new(
        Arc::new(MemoryRunStore::new()),
        Arc::new(MemoryTaskRegistry::new()),
        Arc::new(gateway),
        EngineConfig::default(),
    ))
}

async fn request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_endpoint_responds() {
    let engine = engine_with(StaticGateway::new());
    let router = create_router(engine);

    let (status, body) = request(&router, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn register_submit_poll_round_trip() {
    let engine = engine_with(StaticGateway::new());
    let router = create_router(engine.clone());

    // Register the handler.
    let (status, _) = request(
        &router,
        "POST",
        "/api/tasks",
        Some(json!({
            "name": "echo",
            "code": "local input = ...\nreturn input"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, tasks) = request(&router, "GET", "/api/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tasks, json!(["echo"]));

    // Submit.
    let (status, body) = request(
        &router,
        "POST",
        "/api/task-runs",
        Some(json!({"task_name": "echo", "input": {"msg": "hi"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["task_run_id"].as_str().unwrap().to_string();

    // Drain the queue deterministically, then poll.
    engine.run_until_idle().await.unwrap();

    let (status, run) = request(&router, "GET", &format!("/api/task-runs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "completed");
    assert_eq!(run["result"], json!({"msg": "hi"}));

    // Audit trail is readable.
    let (status, events) = request(
        &router,
        "GET",
        &format!("/api/task-runs/{id}/events"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!events.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn suspended_run_completes_through_module_stub() {
    let engine = engine_with(StaticGateway::new().with_result("keystore", "get", json!("v")));
    let router = create_router(engine.clone());

    request(
        &router,
        "POST",
        "/api/tasks",
        Some(json!({
            "name": "wrap",
            "code": "local input = ...\nlocal v = tools.keystore.get(\"X\")\nreturn { wrapped = v }"
        })),
    )
    .await;

    let (_, body) = request(
        &router,
        "POST",
        "/api/task-runs",
        Some(json!({"task_name": "wrap"})),
    )
    .await;
    let id = body["task_run_id"].as_str().unwrap().to_string();

    engine.run_until_idle().await.unwrap();

    let (_, run) = request(&router, "GET", &format!("/api/task-runs/{id}"), None).await;
    assert_eq!(run["status"], "completed");
    assert_eq!(run["result"], json!({"wrapped": "v"}));
}

#[tokio::test]
async fn unknown_task_submission_is_404() {
    let engine = engine_with(StaticGateway::new());
    let router = create_router(engine);

    let (status, _) = request(
        &router,
        "POST",
        "/api/task-runs",
        Some(json!({"task_name": "ghost"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_task_run_poll_is_404() {
    let engine = engine_with(StaticGateway::new());
    let router = create_router(engine);

    let id = uuid::Uuid::now_v7();
    let (status, _) = request(&router, "GET", &format!("/api/task-runs/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(
        &router,
        "GET",
        &format!("/api/task-runs/{id}/events"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_run_reports_structured_error() {
    let engine = engine_with(StaticGateway::new());
    let router = create_router(engine.clone());

    request(
        &router,
        "POST",
        "/api/tasks",
        Some(json!({"name": "boom", "code": "error('kaput')"})),
    )
    .await;
    let (_, body) = request(
        &router,
        "POST",
        "/api/task-runs",
        Some(json!({"task_name": "boom"})),
    )
    .await;
    let id = body["task_run_id"].as_str().unwrap().to_string();

    engine.run_until_idle().await.unwrap();

    let (_, run) = request(&router, "GET", &format!("/api/task-runs/{id}"), None).await;
    assert_eq!(run["status"], "failed");
    assert_eq!(run["error"]["kind"], "handler");
    assert!(run["error"]["message"].as_str().unwrap().contains("kaput"));
    assert!(run["error"]["failed_stack_run_id"].is_string());
}
