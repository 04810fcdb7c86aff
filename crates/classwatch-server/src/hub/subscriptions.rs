//! Session Subscription Table
//!
//! session id → watching connections, plus the reverse index that keeps a
//! connection on at most one session.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::registry::{Connection, ConnectionId};

#[derive(Default)]
struct TableInner {
    sessions: HashMap<String, HashMap<ConnectionId, Arc<Connection>>>,
    by_connection: HashMap<ConnectionId, String>,
}

impl TableInner {
    fn detach(&mut self, id: ConnectionId) -> Option<String> {
        let session_id = self.by_connection.remove(&id)?;
        if let Some(subscribers) = self.sessions.get_mut(&session_id) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.sessions.remove(&session_id);
            }
        }
        Some(session_id)
    }
}

/// Lock is held for map updates and snapshot copies only, never across a
/// send.
#[derive(Default)]
pub struct SubscriptionTable {
    inner: RwLock<TableInner>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `connection` onto `session_id`. Returns the session it left,
    /// if any.
    pub async fn subscribe(&self, connection: &Arc<Connection>, session_id: &str) -> Option<String> {
        let mut inner = self.inner.write().await;
        let previous = inner.detach(connection.id());
        inner
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(connection.id(), Arc::clone(connection));
        inner
            .by_connection
            .insert(connection.id(), session_id.to_string());
        previous.filter(|p| p != session_id)
    }

    /// No-op when the connection is not subscribed.
    pub async fn unsubscribe(&self, id: ConnectionId) -> Option<String> {
        self.inner.write().await.detach(id)
    }

    pub async fn session_of(&self, id: ConnectionId) -> Option<String> {
        self.inner.read().await.by_connection.get(&id).cloned()
    }

    /// Subscribers at this instant. Later subscribers are not included.
    pub async fn subscribers(&self, session_id: &str) -> Vec<Arc<Connection>> {
        self.inner
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Sessions with at least one subscriber.
    pub async fn active_sessions(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}
