//! Session Lifecycle
//!
//! A session is one bounded classroom-monitoring run:
//! `created → running ⇄ paused → completed`, or `cancelled` from any
//! non-terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EventCategory, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_name(value: &str) -> Option<Self> {
        match value {
            "created" => Some(SessionStatus::Created),
            "running" => Some(SessionStatus::Running),
            "paused" => Some(SessionStatus::Paused),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    pub fn accepts_events(&self) -> bool {
        matches!(self, SessionStatus::Running)
    }

    /// Target state for `action`, or the reason it is not allowed.
    pub fn apply(self, action: SessionAction) -> Result<SessionStatus, TransitionError> {
        use SessionAction as A;
        use SessionStatus as S;

        let next = match (self, action) {
            (S::Created, A::Start) => S::Running,
            (S::Running, A::Pause) => S::Paused,
            (S::Paused, A::Resume) => S::Running,
            (S::Running | S::Paused, A::Complete) => S::Completed,
            (S::Created | S::Running | S::Paused, A::Cancel) => S::Cancelled,
            (from, action) => return Err(TransitionError { from, action }),
        };
        Ok(next)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    Start,
    Pause,
    Resume,
    Complete,
    Cancel,
}

impl SessionAction {
    pub fn parse_name(value: &str) -> Option<Self> {
        match value {
            "start" => Some(SessionAction::Start),
            "pause" => Some(SessionAction::Pause),
            "resume" => Some(SessionAction::Resume),
            "complete" => Some(SessionAction::Complete),
            "cancel" => Some(SessionAction::Cancel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot {action:?} a session that is {from}")]
pub struct TransitionError {
    pub from: SessionStatus,
    pub action: SessionAction,
}

// ============================================================================
// COUNTERS
// ============================================================================

/// Running per-category tallies for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventCounters {
    pub total: u64,
    pub attention: u64,
    pub attention_high: u64,
    pub phone: u64,
    pub posture: u64,
    pub presence: u64,
    pub identity: u64,
    pub distraction: u64,
}

impl EventCounters {
    pub fn record(&mut self, kind: EventKind) {
        self.total += 1;
        match kind.category() {
            EventCategory::Attention => self.attention += 1,
            EventCategory::Phone => self.phone += 1,
            EventCategory::Posture => self.posture += 1,
            EventCategory::Presence => self.presence += 1,
            EventCategory::Identity => self.identity += 1,
        }
        if kind.is_high_attention() {
            self.attention_high += 1;
        }
        if kind.is_distraction() {
            self.distraction += 1;
        }
    }

    /// High-attention share of attention-category events; `None` when there
    /// are no attention events at all.
    pub fn attention_ratio(&self) -> Option<f64> {
        ratio(self.attention_high, self.attention)
    }
}

pub(crate) fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

// ============================================================================
// SESSION RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub course_name: String,
    pub room_number: String,
    pub description: String,
    pub owner_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub peak_students: u32,
    pub counters: EventCounters,
}

impl Session {
    /// Move to the state reached by `action`, stamping lifecycle times.
    pub fn transition(
        &mut self,
        action: SessionAction,
        now: DateTime<Utc>,
    ) -> Result<SessionStatus, TransitionError> {
        let next = self.status.apply(action)?;
        if next == SessionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            if let Some(started) = self.started_at {
                self.duration_seconds = (now - started).num_seconds().max(0);
            }
        }
        self.status = next;
        Ok(next)
    }
}

/// Input for creating a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewSession {
    pub name: String,
    pub course_name: String,
    pub room_number: String,
    pub description: String,
}

impl NewSession {
    pub fn into_session(self, owner_id: &str, now: DateTime<Utc>) -> Session {
        Session {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            course_name: self.course_name,
            room_number: self.room_number,
            description: self.description,
            owner_id: owner_id.to_string(),
            status: SessionStatus::Created,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_seconds: 0,
            peak_students: 0,
            counters: EventCounters::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lifecycle_transitions() {
        use SessionAction::*;
        use SessionStatus::*;

        assert_eq!(Created.apply(Start), Ok(Running));
        assert_eq!(Running.apply(Pause), Ok(Paused));
        assert_eq!(Paused.apply(Resume), Ok(Running));
        assert_eq!(Paused.apply(Complete), Ok(Completed));
        assert_eq!(Created.apply(Cancel), Ok(Cancelled));

        assert!(Created.apply(Complete).is_err());
        assert!(Running.apply(Resume).is_err());
        assert!(Completed.apply(Start).is_err());
        assert!(Cancelled.apply(Resume).is_err());
        assert!(Completed.apply(Cancel).is_err());
    }

    #[test]
    fn test_only_running_accepts_events() {
        assert!(SessionStatus::Running.accepts_events());
        for status in [
            SessionStatus::Created,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
        ] {
            assert!(!status.accepts_events(), "{status} should reject events");
        }
    }

    #[test]
    fn test_transition_stamps_times() {
        let t0 = Utc::now();
        let mut session = NewSession {
            name: "Algebra".into(),
            ..Default::default()
        }
        .into_session("teacher-1", t0);

        session.transition(SessionAction::Start, t0).unwrap();
        assert_eq!(session.started_at, Some(t0));

        let t1 = t0 + Duration::seconds(90);
        session.transition(SessionAction::Complete, t1).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.completed_at, Some(t1));
        assert_eq!(session.duration_seconds, 90);
    }

    #[test]
    fn test_counters_ratio() {
        let mut counters = EventCounters::default();
        assert_eq!(counters.attention_ratio(), None);

        for kind in [
            EventKind::AttentionHigh,
            EventKind::AttentionHigh,
            EventKind::AttentionHigh,
            EventKind::AttentionLow,
            EventKind::PhoneDetected,
            EventKind::PhoneDetected,
        ] {
            counters.record(kind);
        }
        assert_eq!(counters.total, 6);
        assert_eq!(counters.phone, 2);
        assert_eq!(counters.distraction, 3);
        assert_eq!(counters.attention_ratio(), Some(0.75));
    }
}
