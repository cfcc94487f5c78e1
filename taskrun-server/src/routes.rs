//! REST surface over the task engine: register task code, submit runs,
//! poll runs, read the audit trail.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskrun_core::engine::TaskEngine;
use taskrun_core::events::RunEvent;
use taskrun_core::types::TaskRun;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TaskEngine>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterTaskRequest {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterTaskResponse {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub task_name: String,
    /// Defaults to an empty object when omitted.
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_run_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub from_seq: u64,
}

#[derive(Debug, Serialize)]
pub struct EventRecord {
    pub seq: u64,
    pub event: RunEvent,
}

/// POST /api/tasks
async fn register_task(
    State(state): State<AppState>,
    Json(req): Json<RegisterTaskRequest>,
) -> Result<Json<RegisterTaskResponse>, StatusCode> {
    state
        .engine
        .register_task(&req.name, &req.code)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "task registration failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(RegisterTaskResponse { name: req.name }))
}

/// GET /api/tasks
async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<String>>, StatusCode> {
    state
        .engine
        .list_tasks()
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// POST /api/task-runs
async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, StatusCode> {
    let known = state
        .engine
        .list_tasks()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !known.iter().any(|name| name == &req.task_name) {
        return Err(StatusCode::NOT_FOUND);
    }

    let input = req.input.unwrap_or_else(|| serde_json::json!({}));
    let task_run_id = state
        .engine
        .submit(&req.task_name, input)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "submission failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(SubmitResponse { task_run_id }))
}

/// GET /api/task-runs/:id
async fn get_task_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskRun>, StatusCode> {
    state
        .engine
        .task_run(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/task-runs/:id/events
async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventRecord>>, StatusCode> {
    if state
        .engine
        .task_run(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }

    let events = state
        .engine
        .read_events(id, query.from_seq)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(
        events
            .into_iter()
            .map(|(seq, event)| EventRecord { seq, event })
            .collect(),
    ))
}

/// GET /api/health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

pub fn create_router(engine: Arc<TaskEngine>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", post(register_task).get(list_tasks))
        .route("/api/task-runs", post(submit))
        .route("/api/task-runs/:id", get(get_task_run))
        .route("/api/task-runs/:id/events", get(get_events))
        .with_state(AppState { engine })
}
