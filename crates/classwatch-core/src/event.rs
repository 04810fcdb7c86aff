//! Detection Events
//!
//! The closed taxonomy of facts the analysis engine reports about a
//! classroom, and the immutable event record persisted for each one.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// TAXONOMY
// ============================================================================

/// Every detection the engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AttentionHigh,
    AttentionLow,
    AttentionDrop,
    LookingAway,
    DrowsinessDetected,
    PhoneDetected,
    PosturePoor,
    PostureGood,
    StudentEntered,
    StudentLeft,
    StudentIdentified,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::AttentionHigh,
        EventKind::AttentionLow,
        EventKind::AttentionDrop,
        EventKind::LookingAway,
        EventKind::DrowsinessDetected,
        EventKind::PhoneDetected,
        EventKind::PosturePoor,
        EventKind::PostureGood,
        EventKind::StudentEntered,
        EventKind::StudentLeft,
        EventKind::StudentIdentified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AttentionHigh => "attention_high",
            EventKind::AttentionLow => "attention_low",
            EventKind::AttentionDrop => "attention_drop",
            EventKind::LookingAway => "looking_away",
            EventKind::DrowsinessDetected => "drowsiness_detected",
            EventKind::PhoneDetected => "phone_detected",
            EventKind::PosturePoor => "posture_poor",
            EventKind::PostureGood => "posture_good",
            EventKind::StudentEntered => "student_entered",
            EventKind::StudentLeft => "student_left",
            EventKind::StudentIdentified => "student_identified",
        }
    }

    pub fn parse_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// The counter bucket this kind is tallied under.
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::AttentionHigh
            | EventKind::AttentionLow
            | EventKind::AttentionDrop
            | EventKind::LookingAway
            | EventKind::DrowsinessDetected => EventCategory::Attention,
            EventKind::PhoneDetected => EventCategory::Phone,
            EventKind::PosturePoor | EventKind::PostureGood => EventCategory::Posture,
            EventKind::StudentEntered | EventKind::StudentLeft => EventCategory::Presence,
            EventKind::StudentIdentified => EventCategory::Identity,
        }
    }

    /// Numerator of every attention ratio.
    pub fn is_high_attention(&self) -> bool {
        matches!(self, EventKind::AttentionHigh)
    }

    pub fn is_distraction(&self) -> bool {
        matches!(
            self,
            EventKind::AttentionLow
                | EventKind::AttentionDrop
                | EventKind::LookingAway
                | EventKind::DrowsinessDetected
                | EventKind::PhoneDetected
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category buckets used for counters and breakdowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Attention,
    Phone,
    Posture,
    Presence,
    Identity,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Attention,
        EventCategory::Phone,
        EventCategory::Posture,
        EventCategory::Presence,
        EventCategory::Identity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Attention => "attention",
            EventCategory::Phone => "phone",
            EventCategory::Posture => "posture",
            EventCategory::Presence => "presence",
            EventCategory::Identity => "identity",
        }
    }
}

// ============================================================================
// SUBJECTS
// ============================================================================

/// Who an event is about: a transient tracker id, optionally resolved
/// to an enrolled student.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
}

impl SubjectRef {
    pub fn track(track_id: i64) -> Self {
        Self {
            track_id: Some(track_id),
            ..Default::default()
        }
    }

    /// Grouping key: the resolved identity wins over the track.
    /// `None` for class-level events that are about nobody in particular.
    pub fn key(&self) -> Option<String> {
        match (&self.student_id, self.track_id) {
            (Some(id), _) if !id.is_empty() => Some(id.clone()),
            (_, Some(track)) => Some(format!("track_{}", track)),
            _ => None,
        }
    }

    pub fn display_name(&self) -> Option<String> {
        self.student_name
            .clone()
            .or_else(|| self.track_id.map(|t| format!("Track {}", t)))
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// A persisted detection. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    pub id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub subject: SubjectRef,
    #[serde(rename = "eventType")]
    pub kind: EventKind,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub details: Value,
}

impl DetectionEvent {
    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }

    pub fn subject_key(&self) -> Option<String> {
        self.subject.key()
    }
}

/// Oldest accepted event timestamp, in days before now.
pub const MAX_EVENT_AGE_DAYS: i64 = 30;

/// Tolerated clock lead of the producer, in seconds after now.
pub const MAX_EVENT_LEAD_SECS: i64 = 3600;

/// Input for creating an event, as submitted by the analysis engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    #[serde(rename = "eventType", alias = "category")]
    pub kind: EventKind,
    #[serde(flatten)]
    pub subject: SubjectRef,
    pub confidence: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "data")]
    pub details: Option<Value>,
}

impl NewEvent {
    pub fn new(kind: EventKind, confidence: f64) -> Self {
        Self {
            kind,
            subject: SubjectRef::default(),
            confidence,
            timestamp: None,
            details: None,
        }
    }

    pub fn with_subject(mut self, subject: SubjectRef) -> Self {
        self.subject = subject;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn validate(&self) -> Result<(), EventValidationError> {
        self.validate_at(Utc::now())
    }

    /// Confidence within [0, 1]; an explicit timestamp no older than
    /// [`MAX_EVENT_AGE_DAYS`] and no further ahead than
    /// [`MAX_EVENT_LEAD_SECS`] relative to `now`.
    pub fn validate_at(&self, now: DateTime<Utc>) -> Result<(), EventValidationError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(EventValidationError::Confidence(self.confidence));
        }
        if let Some(timestamp) = self.timestamp {
            let earliest = TimeDelta::try_days(MAX_EVENT_AGE_DAYS).and_then(|age| now.checked_sub_signed(age));
            let latest = TimeDelta::try_seconds(MAX_EVENT_LEAD_SECS).and_then(|lead| now.checked_add_signed(lead));
            let too_old = earliest.is_some_and(|earliest| timestamp < earliest);
            let too_new = latest.is_some_and(|latest| timestamp > latest);
            if too_old || too_new {
                return Err(EventValidationError::Timestamp(timestamp));
            }
        }
        Ok(())
    }

    /// Assign an id and fill defaults. Call after [`NewEvent::validate`].
    pub fn into_event(self, session_id: &str, now: DateTime<Utc>) -> DetectionEvent {
        DetectionEvent {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            subject: self.subject,
            kind: self.kind,
            confidence: self.confidence,
            timestamp: self.timestamp.unwrap_or(now),
            details: self.details.unwrap_or_else(|| Value::Object(Default::default())),
        }
    }
}

/// Event input rejected before anything was persisted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventValidationError {
    #[error("confidence must be within [0, 1], got {0}")]
    Confidence(f64),
    #[error("timestamp {0} is outside the accepted window")]
    Timestamp(DateTime<Utc>),
}
