// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes surfaced to API and WebSocket callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    SessionNotFound,
    TaskNotFound,
    NoPort,
    AlreadyRunning,
    AlreadyStarting,
    SpawnFailed,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::SessionNotFound => 404,
            Self::TaskNotFound => 404,
            Self::NoPort => 422,
            Self::AlreadyRunning => 409,
            Self::AlreadyStarting => 409,
            Self::SpawnFailed => 500,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::NoPort => "NO_PORT",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::AlreadyStarting => "ALREADY_STARTING",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Wrap a message into an [`ApiError`] carrying this code.
    pub fn with(self, message: impl Into<String>) -> ApiError {
        ApiError { code: self, message: message.into() }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed operator request: a machine-readable code and a human message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody { code: self.code.as_str().to_owned(), message: self.message.clone() }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse { error: self.to_error_body() })).into_response()
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
