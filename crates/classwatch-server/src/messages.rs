//! WebSocket wire messages.
//!
//! Both directions are closed, `type`-tagged enums; an unknown tag is a
//! [`ProtocolError::Malformed`], never a silent drop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use classwatch_core::{DetectionEvent, LiveMetrics, ProducerMetrics, SessionStatus};

/// Messages a dashboard (or a producer) may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    SubscribeSession {
        session_id: String,
    },
    UnsubscribeSession,
    /// Producer forwarding engine metrics through the socket. Falls back to
    /// the connection's current subscription when `sessionId` is absent.
    LiveMetrics {
        #[serde(default)]
        session_id: Option<String>,
        data: ProducerMetrics,
    },
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Messages the hub sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        user_id: String,
        connection_id: String,
        version: &'static str,
    },
    Subscribed {
        session_id: String,
        session_status: SessionStatus,
    },
    Unsubscribed {
        session_id: Option<String>,
    },
    Error {
        message: String,
        code: &'static str,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    LiveMetrics {
        session_id: String,
        data: LiveMetrics,
        timestamp: DateTime<Utc>,
    },
    Event {
        session_id: String,
        event: DetectionEvent,
    },
    SessionStatus {
        session_id: String,
        status: SessionStatus,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, code: &'static str) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code,
        }
    }

    pub fn live_metrics(session_id: &str, data: LiveMetrics) -> Self {
        ServerMessage::LiveMetrics {
            session_id: session_id.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn event(event: &DetectionEvent) -> Self {
        ServerMessage::Event {
            session_id: event.session_id.clone(),
            event: event.clone(),
        }
    }

    pub fn session_status(session_id: &str, status: SessionStatus) -> Self {
        ServerMessage::SessionStatus {
            session_id: session_id.to_string(),
            status,
            timestamp: Utc::now(),
        }
    }

    /// Wire name of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::LiveMetrics { .. } => "live_metrics",
            ServerMessage::Event { .. } => "event",
            ServerMessage::SessionStatus { .. } => "session_status",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
