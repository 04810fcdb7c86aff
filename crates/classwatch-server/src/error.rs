//! API error type and its JSON response.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use classwatch_core::StorageError;

use crate::hub::HubError;
use crate::ingest::IngestError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing bearer token")]
    AuthRequired,
    #[error("Invalid token")]
    AuthInvalid,
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    SessionNotRunning(String),
    #[error("{0}")]
    InvalidTransition(String),
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("{0}")]
    UpstreamUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired | ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionNotRunning(_) | ApiError::InvalidTransition(_) => StatusCode::CONFLICT,
            ApiError::Malformed(_) => StatusCode::BAD_REQUEST,
            ApiError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "AUTH_REQUIRED",
            ApiError::AuthInvalid => "AUTH_INVALID",
            ApiError::AccessDenied(_) => "ACCESS_DENIED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::SessionNotRunning(_) => "SESSION_NOT_RUNNING",
            ApiError::InvalidTransition(_) => "INVALID_TRANSITION",
            ApiError::Malformed(_) => "MALFORMED_MESSAGE",
            ApiError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::NotFound(id) => ApiError::NotFound(id),
            e @ IngestError::SessionNotRunning { .. } => ApiError::SessionNotRunning(e.to_string()),
            e @ IngestError::InvalidEvent { .. } => ApiError::Malformed(e.to_string()),
            IngestError::InvalidTransition(e) => ApiError::InvalidTransition(e.to_string()),
            e @ IngestError::UpstreamUnavailable(_) => ApiError::UpstreamUnavailable(e.to_string()),
            IngestError::Storage(e) => e.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => ApiError::NotFound(id),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::AccessDenied(id) => ApiError::AccessDenied(id),
            HubError::NotFound(id) => ApiError::NotFound(id),
            HubError::Directory(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = %status, code, message = %message, "Request error");
        } else {
            tracing::debug!(status = %status, code, message = %message, "Request rejected");
        }

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}
