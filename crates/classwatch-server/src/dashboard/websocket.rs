//! WebSocket handler for live session streams.
//!
//! Clients connect to `/ws?token=…&sessionId=…`. The token is checked
//! before anything else is exchanged; a missing or unknown token gets a
//! close frame (4001 / 4002) and nothing more. After that the socket task
//! just drains the connection's outbound queue and dispatches inbound
//! messages.

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::state::AppState;
use crate::auth::bearer_token;
use crate::error::ApiError;
use crate::hub::{Connection, Outbound, close_code};
use crate::messages::{ClientMessage, ServerMessage};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub token: Option<String>,
    pub session_id: Option<String>,
}

/// WebSocket upgrade handler: GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = params
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers).map(str::to_string));
    ws.on_upgrade(move |socket| handle_socket(socket, state, token, params.session_id))
}

/// Resolve the handshake token to a user id or a close frame.
fn authenticate(state: &AppState, token: Option<&str>) -> Result<String, (u16, &'static str)> {
    let token = token.ok_or((close_code::AUTH_REQUIRED, "authentication required"))?;
    state
        .verifier
        .verify(token)
        .ok_or((close_code::AUTH_INVALID, "invalid token"))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    token: Option<String>,
    session_id: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    let user_id = match authenticate(&state, token.as_deref()) {
        Ok(user_id) => user_id,
        Err((code, reason)) => {
            debug!(code, reason, "WebSocket handshake rejected");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    let hub = Arc::clone(state.hub());
    let (connection, mut outbound) = hub.register(&user_id).await;
    connection.send(&ServerMessage::Connected {
        user_id: user_id.clone(),
        connection_id: connection.id().to_string(),
        version: env!("CARGO_PKG_VERSION"),
    });
    if let Some(session_id) = session_id.filter(|s| !s.is_empty()) {
        subscribe(&state, &connection, &session_id).await;
    }

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let frame = match queued {
                    Some(Outbound::Text(text)) => Message::Text(text.into()),
                    Some(Outbound::Ping) => Message::Ping(Bytes::new()),
                    Some(Outbound::Close { code, reason }) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        break;
                    }
                    None => break,
                };
                if sender.send(frame).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Pong(_))) => connection.mark_alive(),
                    Some(Ok(Message::Ping(data))) => {
                        connection.mark_alive();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &connection, text.as_str()).await;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %connection.id(), "WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    hub.deregister(connection.id()).await;
}

async fn subscribe(state: &AppState, connection: &Arc<Connection>, session_id: &str) {
    let directory = state.pipeline.storage().as_ref();
    let reply = match state.hub().subscribe(connection, session_id, directory).await {
        Ok(session_status) => ServerMessage::Subscribed {
            session_id: session_id.to_string(),
            session_status,
        },
        Err(e) => ServerMessage::error(e.to_string(), e.code()),
    };
    connection.send(&reply);
}

/// Dispatch one inbound text frame. Every failure is answered on this
/// connection only.
async fn handle_client_message(state: &AppState, connection: &Arc<Connection>, text: &str) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            connection.send(&ServerMessage::error(e.to_string(), "MALFORMED_MESSAGE"));
            return;
        }
    };

    match message {
        ClientMessage::SubscribeSession { session_id } => {
            subscribe(state, connection, &session_id).await;
        }
        ClientMessage::UnsubscribeSession => {
            let session_id = state.hub().unsubscribe(connection.id()).await;
            connection.send(&ServerMessage::Unsubscribed { session_id });
        }
        ClientMessage::LiveMetrics { session_id, data } => {
            let target = match session_id {
                Some(id) => Some(id),
                None => state.hub().subscription_of(connection.id()).await,
            };
            let Some(target) = target else {
                connection.send(&ServerMessage::error(
                    "live_metrics needs a sessionId or an active subscription",
                    "MALFORMED_MESSAGE",
                ));
                return;
            };
            if let Err(e) = state.pipeline.ingest_metrics(&target, &data).await {
                let e = ApiError::from(e);
                connection.send(&ServerMessage::error(e.to_string(), e.code()));
            }
        }
        ClientMessage::Ping => {
            connection.mark_alive();
            connection.send(&ServerMessage::Pong {
                timestamp: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokens;
    use crate::ingest::{IngestConfig, IngestPipeline};
    use classwatch_core::{NewSession, SessionAction, Storage};
    use tempfile::TempDir;

    async fn setup() -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("ws.db"))).unwrap());
        let (pipeline, _handle) = IngestPipeline::new(
            storage,
            crate::hub::BroadcastHub::new(),
            None,
            IngestConfig::default(),
        );
        let tokens = StaticTokens::default().with("t1", "teacher-1");
        (AppState::new(pipeline, Arc::new(tokens)), dir)
    }

    fn next_json(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> serde_json::Value {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_authenticate_codes() {
        let (state, _dir) = setup().await;
        assert_eq!(authenticate(&state, Some("t1")), Ok("teacher-1".to_string()));
        assert_eq!(authenticate(&state, None).unwrap_err().0, close_code::AUTH_REQUIRED);
        assert_eq!(authenticate(&state, Some("bad")).unwrap_err().0, close_code::AUTH_INVALID);
    }

    #[tokio::test]
    async fn test_client_messages() {
        let (state, _dir) = setup().await;
        let session = state
            .pipeline
            .create_session("teacher-1", NewSession::default())
            .unwrap();
        let (conn, mut rx) = state.hub().register("teacher-1").await;

        handle_client_message(&state, &conn, r#"{"type":"hello"}"#).await;
        assert_eq!(next_json(&mut rx)["code"], "MALFORMED_MESSAGE");

        let subscribe = format!(r#"{{"type":"subscribe_session","sessionId":"{}"}}"#, session.id);
        handle_client_message(&state, &conn, &subscribe).await;
        let ack = next_json(&mut rx);
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["sessionStatus"], "created");

        // not running yet
        handle_client_message(&state, &conn, r#"{"type":"live_metrics","data":{"studentCount":4}}"#).await;
        assert_eq!(next_json(&mut rx)["code"], "SESSION_NOT_RUNNING");

        state
            .pipeline
            .transition(&session.id, SessionAction::Start)
            .await
            .unwrap();
        assert_eq!(next_json(&mut rx)["type"], "session_status");

        handle_client_message(&state, &conn, r#"{"type":"live_metrics","data":{"studentCount":4}}"#).await;
        let live = next_json(&mut rx);
        assert_eq!(live["type"], "live_metrics");
        assert_eq!(live["data"]["studentCount"], 4);

        handle_client_message(&state, &conn, r#"{"type":"ping"}"#).await;
        assert_eq!(next_json(&mut rx)["type"], "pong");

        handle_client_message(&state, &conn, r#"{"type":"unsubscribe_session"}"#).await;
        assert_eq!(next_json(&mut rx)["sessionId"], session.id.as_str());
    }

    #[tokio::test]
    async fn test_subscribe_to_foreign_session() {
        let (state, _dir) = setup().await;
        let session = state
            .pipeline
            .create_session("teacher-2", NewSession::default())
            .unwrap();
        let (conn, mut rx) = state.hub().register("teacher-1").await;

        subscribe(&state, &conn, &session.id).await;
        assert_eq!(next_json(&mut rx)["code"], "ACCESS_DENIED");
        subscribe(&state, &conn, "missing").await;
        assert_eq!(next_json(&mut rx)["code"], "NOT_FOUND");
    }
}
