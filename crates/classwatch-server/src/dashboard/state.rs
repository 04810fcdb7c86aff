//! Dashboard shared state

use std::sync::Arc;
use std::time::Instant;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use classwatch_core::Session;

use crate::auth::{TokenVerifier, bearer_token};
use crate::error::{ApiError, ApiResult};
use crate::hub::BroadcastHub;
use crate::ingest::IngestPipeline;

/// Shared application state for the dashboard
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            pipeline,
            verifier,
            start_time: Instant::now(),
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        self.pipeline.hub()
    }

    /// The session, if `user_id` owns it.
    pub async fn owned_session(&self, user_id: &str, session_id: &str) -> ApiResult<Session> {
        let session = self.pipeline.get_session(session_id).await?;
        if session.owner_id != user_id {
            return Err(ApiError::AccessDenied(session_id.to_string()));
        }
        Ok(session)
    }
}

/// Caller identity from `Authorization: Bearer`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser(pub String);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ApiError::AuthRequired)?;
        state
            .verifier
            .verify(token)
            .map(AuthUser)
            .ok_or(ApiError::AuthInvalid)
    }
}
