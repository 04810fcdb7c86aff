//! Broadcast Hub
//!
//! Owns the connection registry and the session subscription table and fans
//! session-scoped messages out to whoever is watching.
//!
//! Per-session ordering is the caller's: the ingest pipeline broadcasts while
//! holding that session's runtime lock, so the hub only has to preserve the
//! order of its own calls, which the per-connection FIFO queues do.

pub mod liveness;
pub mod registry;
pub mod subscriptions;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use classwatch_core::{SessionStatus, Storage};

use crate::messages::ServerMessage;
pub use liveness::{LivenessMonitor, SweepReport};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, Outbound};
pub use subscriptions::SubscriptionTable;

/// WebSocket close codes the hub emits.
pub mod close_code {
    pub const AUTH_REQUIRED: u16 = 4001;
    pub const AUTH_INVALID: u16 = 4002;
    pub const UNRESPONSIVE: u16 = 4008;
    pub const GOING_AWAY: u16 = 1001;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    #[error("Access denied to session {0}")]
    AccessDenied(String),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session lookup failed: {0}")]
    Directory(String),
}

impl HubError {
    pub fn code(&self) -> &'static str {
        match self {
            HubError::AccessDenied(_) => "ACCESS_DENIED",
            HubError::NotFound(_) => "NOT_FOUND",
            HubError::Directory(_) => "INTERNAL_ERROR",
        }
    }
}

/// Ownership facts the hub needs to authorize a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAccess {
    pub owner_id: String,
    pub status: SessionStatus,
}

/// Authoritative session-ownership record.
pub trait SessionDirectory: Send + Sync {
    fn session_access(&self, session_id: &str) -> Result<Option<SessionAccess>, HubError>;
}

impl SessionDirectory for Storage {
    fn session_access(&self, session_id: &str) -> Result<Option<SessionAccess>, HubError> {
        self.get_session(session_id)
            .map(|session| {
                session.map(|s| SessionAccess {
                    owner_id: s.owner_id,
                    status: s.status,
                })
            })
            .map_err(|e| HubError::Directory(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connections: usize,
    pub users: usize,
    pub active_sessions: usize,
}

#[derive(Default)]
pub struct BroadcastHub {
    registry: ConnectionRegistry,
    subscriptions: SubscriptionTable,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(
        &self,
        user_id: &str,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        self.registry.register(user_id).await
    }

    /// Remove the connection and whatever it was subscribed to. Idempotent.
    pub async fn deregister(&self, id: ConnectionId) {
        if let Some(session_id) = self.subscriptions.unsubscribe(id).await {
            tracing::debug!(connection_id = %id, session_id, "Subscription dropped on disconnect");
        }
        self.registry.deregister(id).await;
    }

    /// Authorize and move `connection` onto `session_id`. Returns the
    /// session's status for the acknowledgement.
    pub async fn subscribe(
        &self,
        connection: &Arc<Connection>,
        session_id: &str,
        directory: &dyn SessionDirectory,
    ) -> Result<SessionStatus, HubError> {
        let access = directory
            .session_access(session_id)?
            .ok_or_else(|| HubError::NotFound(session_id.to_string()))?;
        if access.owner_id != connection.user_id() {
            tracing::warn!(
                connection_id = %connection.id(),
                user_id = connection.user_id(),
                session_id,
                "Subscription refused: not the session owner"
            );
            return Err(HubError::AccessDenied(session_id.to_string()));
        }

        self.subscriptions.subscribe(connection, session_id).await;
        tracing::debug!(connection_id = %connection.id(), session_id, "Subscribed");
        Ok(access.status)
    }

    pub async fn unsubscribe(&self, id: ConnectionId) -> Option<String> {
        self.subscriptions.unsubscribe(id).await
    }

    pub async fn subscription_of(&self, id: ConnectionId) -> Option<String> {
        self.subscriptions.session_of(id).await
    }

    /// Deliver to every current subscriber of `session_id`. A subscriber
    /// whose queue is closed is skipped; eviction is left to liveness.
    /// Returns how many connections accepted the message.
    pub async fn broadcast(&self, session_id: &str, message: &ServerMessage) -> usize {
        let subscribers = self.subscriptions.subscribers(session_id).await;
        if subscribers.is_empty() {
            return 0;
        }

        let json = message.to_json();
        let mut delivered = 0;
        for connection in &subscribers {
            if connection.send_text(json.clone()) {
                delivered += 1;
            } else {
                tracing::warn!(
                    connection_id = %connection.id(),
                    session_id,
                    message_type = message.kind(),
                    "Failed to send message"
                );
            }
        }
        tracing::trace!(session_id, message_type = message.kind(), delivered, "Broadcast");
        delivered
    }

    /// Direct delivery to every connection of one user.
    pub async fn send_to_user(&self, user_id: &str, message: &ServerMessage) {
        for connection in self.registry.connections_of(user_id).await {
            if !connection.send(message) {
                tracing::warn!(connection_id = %connection.id(), "Failed to send message");
            }
        }
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.snapshot().await
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len().await,
            users: self.registry.user_count().await,
            active_sessions: self.subscriptions.active_sessions().await,
        }
    }

    /// Ask every socket task to close, e.g. on shutdown.
    pub async fn close_all(&self, code: u16, reason: &str) {
        for connection in self.registry.snapshot().await {
            connection.close(code, reason);
        }
    }
}
