// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST handlers. Each one is a thin adapter over the task manager and the
//! session registry; failures render as [`ApiError`] bodies.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ErrorCode};
use crate::health::ReconcileReport;
use crate::manager::{StartOutcome, StopOutcome, TaskStatus, TerminalRequest};
use crate::session::registry::TerminalSummary;
use crate::session::{SessionInfo, SessionKind};
use crate::transport::state::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Response for `GET /api/v1/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}

/// Response for `DELETE /api/v1/sessions/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyResponse {
    pub session_id: String,
    pub destroyed: bool,
}

/// Response for `GET /api/v1/tasks/{task}/terminals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalsResponse {
    pub sessions: Vec<TerminalSummary>,
}

/// Response for `POST /api/v1/tasks/{task}/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub task_no: String,
    #[serde(flatten)]
    pub outcome: StartOutcome,
}

/// Response for `POST /api/v1/tasks/{task}/stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub task_no: String,
    #[serde(flatten)]
    pub outcome: StopOutcome,
}

/// Response for `POST /api/v1/tasks/{task}/logs/clear`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearLogResponse {
    pub task_no: String,
    pub cleared: bool,
}

/// Response for `POST /api/v1/health-check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub report: ReconcileReport,
    pub tasks: Vec<TaskStatus>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "running".to_owned(), sessions: s.registry.len() })
}

/// `GET /api/v1/sessions`
pub async fn list_sessions(State(s): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(s.registry.list())
}

/// `DELETE /api/v1/sessions/{id}` destroys a terminal. Server sessions are
/// only stopped through their task.
pub async fn delete_session(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DestroyResponse>, ApiError> {
    let session = s
        .registry
        .get(&id)
        .ok_or_else(|| ErrorCode::SessionNotFound.with(format!("no session {id}")))?;
    if session.kind() == SessionKind::Server {
        return Err(ErrorCode::BadRequest.with(format!("{id} is a server session; stop its task")));
    }
    s.registry.destroy_session(&session);
    Ok(Json(DestroyResponse { session_id: id, destroyed: true }))
}

/// `POST /api/v1/terminals`
pub async fn create_terminal(
    State(s): State<Arc<AppState>>,
    Json(request): Json<TerminalRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let session = s.manager.create_terminal(request)?;
    Ok((StatusCode::CREATED, Json(session.info())))
}

/// `GET /api/v1/tasks/{task}/terminals`
pub async fn task_terminals(
    State(s): State<Arc<AppState>>,
    Path(task): Path<String>,
) -> Json<TerminalsResponse> {
    Json(TerminalsResponse { sessions: s.manager.list_terminals_for_task(&task) })
}

/// `POST /api/v1/tasks/{task}/start`
pub async fn start_task(
    State(s): State<Arc<AppState>>,
    Path(task): Path<String>,
) -> Result<Json<StartResponse>, ApiError> {
    let outcome = s.manager.start_server(&task).await?;
    Ok(Json(StartResponse { task_no: task, outcome }))
}

/// `POST /api/v1/tasks/{task}/stop`
pub async fn stop_task(
    State(s): State<Arc<AppState>>,
    Path(task): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let outcome = s.manager.stop_server(&task).await?;
    Ok(Json(StopResponse { task_no: task, outcome }))
}

/// `GET /api/v1/tasks/{task}/status`
pub async fn task_status(
    State(s): State<Arc<AppState>>,
    Path(task): Path<String>,
) -> Json<TaskStatus> {
    Json(s.manager.status(&task))
}

/// `POST /api/v1/tasks/{task}/logs/clear`
pub async fn clear_logs(
    State(s): State<Arc<AppState>>,
    Path(task): Path<String>,
) -> Result<Json<ClearLogResponse>, ApiError> {
    let cleared = s.manager.clear_log(&task)?;
    Ok(Json(ClearLogResponse { task_no: task, cleared }))
}

/// `POST /api/v1/health-check` runs one reconciliation pass immediately.
pub async fn run_health_check(
    State(s): State<Arc<AppState>>,
) -> Result<Json<HealthCheckResponse>, ApiError> {
    let report = s.reconciler.reconcile_once().await;
    let tasks = s.manager.statuses()?;
    Ok(Json(HealthCheckResponse { report, tasks }))
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
