//! Connection Registry
//!
//! Every live client channel, keyed by connection id and by owning user.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::messages::ServerMessage;

pub type ConnectionId = Uuid;

/// What the hub asks a socket task to write.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// One authenticated client channel.
///
/// Sending never blocks: each connection owns an unbounded queue drained by
/// its socket task. A send that fails means the task is gone.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    awaiting_pong: AtomicBool,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn send(&self, message: &ServerMessage) -> bool {
        self.send_text(message.to_json())
    }

    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Text(text)).is_ok()
    }

    pub fn ping(&self) -> bool {
        self.tx.send(Outbound::Ping).is_ok()
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Any pong (or client heartbeat) clears the unresponsive flag.
    pub fn mark_alive(&self) {
        self.awaiting_pong.store(false, Ordering::Release);
    }

    /// Flag the connection as probed. Returns whether the previous probe
    /// was still unanswered.
    pub fn begin_probe(&self) -> bool {
        self.awaiting_pong.swap(true, Ordering::AcqRel)
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        user_id: &str,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            tx,
            awaiting_pong: AtomicBool::new(false),
        });

        let mut inner = self.inner.write().await;
        inner
            .connections
            .insert(connection.id, Arc::clone(&connection));
        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection.id);

        tracing::info!(connection_id = %connection.id, user_id, "Client connected");
        (connection, rx)
    }

    /// Idempotent; returns the removed connection the first time only.
    pub async fn deregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        let connection = inner.connections.remove(&id)?;
        if let Some(ids) = inner.by_user.get_mut(connection.user_id()) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_user.remove(connection.user_id());
            }
        }
        tracing::info!(connection_id = %id, "Client disconnected");
        Some(connection)
    }

    pub async fn connections_of(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Point-in-time copy of every connection.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn user_count(&self) -> usize {
        self.inner.read().await.by_user.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_lookup_by_user() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = registry.register("teacher-1").await;
        let (_b, _rx_b) = registry.register("teacher-1").await;
        let (_c, _rx_c) = registry.register("teacher-2").await;

        assert_eq!(registry.len().await, 3);
        assert_eq!(registry.user_count().await, 2);
        assert_eq!(registry.connections_of("teacher-1").await.len(), 2);

        assert!(registry.deregister(a.id()).await.is_some());
        assert!(registry.deregister(a.id()).await.is_none());
        assert_eq!(registry.connections_of("teacher-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_user_index_drops_last_connection() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = registry.register("teacher-1").await;
        registry.deregister(a.id()).await;
        assert_eq!(registry.user_count().await, 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_probe_flag() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = registry.register("u").await;

        assert!(!conn.begin_probe());
        assert!(conn.ping());
        assert_eq!(rx.recv().await, Some(Outbound::Ping));
        assert!(conn.begin_probe());

        conn.mark_alive();
        assert!(!conn.is_awaiting_pong());
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = registry.register("u").await;
        drop(rx);
        assert!(!conn.send(&ServerMessage::error("x", "TEST")));
    }
}
