//! Dashboard API endpoint handlers

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use classwatch_core::{
    MAX_TIMELINE_INTERVAL_MS, NewEvent, NewSession, ProducerMetrics, SessionAction, SessionStatus,
};

use super::state::{AppState, AuthUser};
use crate::error::{ApiError, ApiResult};

/// JSON body decoding that reports failures in the API's own error shape.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::Malformed(e.to_string()))
}

// ============================================================================
// SESSIONS
// ============================================================================

pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let input: NewSession = if body.is_empty() {
        NewSession::default()
    } else {
        parse_body(&body)?
    };
    let session = state.pipeline.create_session(&user_id, input)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "session": session }))))
}

#[derive(Debug, Deserialize)]
pub struct SessionListParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// Sessions owned by the caller, newest first
pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<SessionListParams>,
) -> ApiResult<Json<Value>> {
    let status = match params.status.as_deref() {
        Some(name) => Some(
            SessionStatus::parse_name(name)
                .ok_or_else(|| ApiError::Malformed(format!("unknown status '{}'", name)))?,
        ),
        None => None,
    };
    let limit = params.limit.unwrap_or(50).clamp(1, 500);

    let sessions: Vec<_> = state
        .pipeline
        .list_sessions(status, None)
        .await?
        .into_iter()
        .filter(|s| s.owner_id == user_id)
        .take(limit)
        .collect();

    Ok(Json(serde_json::json!({
        "total": sessions.len(),
        "sessions": sessions,
    })))
}

pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.owned_session(&user_id, &id).await?;
    let live = match session.status {
        SessionStatus::Running | SessionStatus::Paused => Some(state.pipeline.live_metrics(&id).await?),
        _ => state.pipeline.storage().get_live_snapshot(&id)?,
    };
    Ok(Json(serde_json::json!({
        "session": session,
        "liveMetrics": live,
    })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.owned_session(&user_id, &id).await?;
    let deleted = state.pipeline.delete_session(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn apply_action(
    state: &AppState,
    user_id: &str,
    id: &str,
    action: SessionAction,
) -> ApiResult<Json<Value>> {
    state.owned_session(user_id, id).await?;
    let session = state.pipeline.transition(id, action).await?;
    Ok(Json(serde_json::json!({ "session": session })))
}

pub async fn start_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    apply_action(&state, &user_id, &id, SessionAction::Start).await
}

pub async fn pause_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    apply_action(&state, &user_id, &id, SessionAction::Pause).await
}

pub async fn resume_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    apply_action(&state, &user_id, &id, SessionAction::Resume).await
}

pub async fn complete_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    apply_action(&state, &user_id, &id, SessionAction::Complete).await
}

pub async fn cancel_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    apply_action(&state, &user_id, &id, SessionAction::Cancel).await
}

// ============================================================================
// INGEST (valid token only; the engine pushes on the owner's behalf)
// ============================================================================

pub async fn ingest_event(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let event: NewEvent = parse_body(&body)?;
    let created = state.pipeline.ingest_one(&id, event).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "event": created }))))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchBody {
    Wrapped { events: Vec<NewEvent> },
    List(Vec<NewEvent>),
}

pub async fn ingest_batch(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let events = match parse_body::<BatchBody>(&body)? {
        BatchBody::Wrapped { events } | BatchBody::List(events) => events,
    };
    let created = state.pipeline.ingest_batch(&id, events).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "accepted": created.len(),
            "events": created,
        })),
    ))
}

pub async fn ingest_metrics(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let metrics: ProducerMetrics = parse_body(&body)?;
    let live = state.pipeline.ingest_metrics(&id, &metrics).await?;
    Ok(Json(serde_json::json!({ "liveMetrics": live })))
}

// ============================================================================
// ANALYTICS
// ============================================================================

pub async fn get_live_metrics(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.owned_session(&user_id, &id).await?;
    let live = state.pipeline.live_metrics(&id).await?;
    Ok(Json(serde_json::json!({ "liveMetrics": live })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineParams {
    pub interval_ms: Option<i64>,
}

pub async fn get_timeline(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    Query(params): Query<TimelineParams>,
) -> ApiResult<Json<Value>> {
    state.owned_session(&user_id, &id).await?;
    let requested = params
        .interval_ms
        .filter(|ms| *ms > 0)
        .unwrap_or(state.pipeline.timeline_interval_ms())
        .min(MAX_TIMELINE_INTERVAL_MS);
    let buckets = state.pipeline.timeline(&id, Some(requested))?;
    // wide spans get wider buckets than requested
    let interval_ms = buckets
        .first()
        .map(|b| (b.end - b.start).num_milliseconds())
        .unwrap_or(requested);
    Ok(Json(serde_json::json!({
        "sessionId": id,
        "intervalMs": interval_ms,
        "buckets": buckets.as_ref(),
    })))
}

pub async fn get_categories(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.owned_session(&user_id, &id).await?;
    let categories = state.pipeline.category_breakdown(&id)?;
    Ok(Json(serde_json::json!({
        "sessionId": id,
        "categories": categories.as_ref(),
    })))
}

pub async fn get_subjects(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.owned_session(&user_id, &id).await?;
    let subjects = state.pipeline.subject_metrics(&id)?;
    Ok(Json(serde_json::json!({
        "sessionId": id,
        "subjects": subjects.as_ref(),
    })))
}

pub async fn get_report(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.owned_session(&user_id, &id).await?;
    let report = state.pipeline.report(&id).await?;
    Ok(Json(serde_json::json!({
        "final": session.status == SessionStatus::Completed,
        "report": report,
    })))
}

// ============================================================================
// STATS & HEALTH
// ============================================================================

pub async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let hub = state.hub().stats().await;
    let storage = state.pipeline.storage().get_stats()?;

    Ok(Json(serde_json::json!({
        "connections": hub.connections,
        "users": hub.users,
        "activeSessions": hub.active_sessions,
        "totalSessions": storage.total_sessions,
        "runningSessions": storage.active_sessions,
        "totalEvents": storage.total_events,
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    })))
}

pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let status = match state.pipeline.storage().get_stats() {
        Ok(_) => "healthy",
        Err(e) => {
            tracing::warn!("Health check storage probe failed: {}", e);
            "degraded"
        }
    };
    Ok(Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
