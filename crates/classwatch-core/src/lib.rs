//! # Classwatch Core
//!
//! Domain layer for live classroom monitoring sessions.
//!
//! - **Event taxonomy**: eleven detection kinds grouped into five categories
//! - **Session lifecycle**: `created → running ⇄ paused → completed | cancelled`
//! - **Storage**: SQLite (WAL) with an append-only event log per session
//! - **Analytics**: O(1) live aggregates plus timeline, per-subject and
//!   per-category reports computed from the log
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use classwatch_core::{EventKind, NewEvent, NewSession, SessionAction, Storage};
//!
//! let storage = Storage::new(None)?;
//! let mut session = NewSession::default().into_session("teacher-1", chrono::Utc::now());
//! storage.create_session(&session)?;
//!
//! session.transition(SessionAction::Start, chrono::Utc::now())?;
//! storage.update_session_lifecycle(&session)?;
//!
//! let event = NewEvent::new(EventKind::PhoneDetected, 0.92).into_event(&session.id, chrono::Utc::now());
//! storage.insert_events(&[event])?;
//! ```
//!
//! ## Feature Flags
//!
//! - `bundled-sqlite` (default): statically linked SQLite
//! - `encryption`: SQLCipher; set `CLASSWATCH_ENCRYPTION_KEY`

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod analytics;
pub mod event;
pub mod session;
pub mod storage;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use analytics::{
    CategoryBreakdown, DEFAULT_TIMELINE_INTERVAL_MS, ExternalAnalytics, FinalReport,
    LiveAggregator, LiveMetrics, MAX_TIMELINE_INTERVAL_MS, ProducerMetrics, SubjectMetric,
    TimelineBucket,
};
pub use event::{
    DetectionEvent, EventCategory, EventKind, EventValidationError, NewEvent, SubjectRef,
};
pub use session::{
    EventCounters, NewSession, Session, SessionAction, SessionStatus, TransitionError,
};
pub use storage::{Storage, StorageError, StorageStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
