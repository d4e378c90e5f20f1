// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP and WebSocket surface of the session manager.

pub mod http;
pub mod state;
pub mod ws;
pub mod ws_logs;

pub use state::AppState;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the axum `Router` with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::health))
        .route("/api/v1/sessions", get(http::list_sessions))
        .route("/api/v1/sessions/{id}", delete(http::delete_session))
        .route("/api/v1/terminals", post(http::create_terminal))
        .route("/api/v1/tasks/{task}/terminals", get(http::task_terminals))
        .route("/api/v1/tasks/{task}/start", post(http::start_task))
        .route("/api/v1/tasks/{task}/stop", post(http::stop_task))
        .route("/api/v1/tasks/{task}/status", get(http::task_status))
        .route("/api/v1/tasks/{task}/logs/clear", post(http::clear_logs))
        .route("/api/v1/health-check", post(http::run_health_check))
        .route("/ws/terminal", get(ws::terminal_ws))
        .route("/ws/terminal/{session_id}", get(ws::terminal_ws_for))
        .route("/ws/logs", get(ws_logs::logs_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
