//! SQLite Storage Implementation
//!
//! Session records and the append-only detection log.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::analytics::{FinalReport, LiveMetrics};
use crate::event::{DetectionEvent, EventKind, SubjectRef};
use crate::session::{EventCounters, Session, SessionStatus};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// Store-wide totals for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_events: u64,
}

// ============================================================================
// STORAGE
// ============================================================================

/// Session and event store.
///
/// Separate reader/writer connections behind mutexes; every method takes
/// `&self`, so the server shares one `Arc<Storage>`.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

const SESSION_COLUMNS: &str = "id, name, course_name, room_number, description, owner_id, status,
     created_at, started_at, completed_at, duration_seconds, peak_students, counters";

const EVENT_COLUMNS: &str =
    "id, session_id, track_id, student_id, student_name, event_type, confidence, timestamp, details";

impl Storage {
    /// Apply PRAGMAs and optional encryption to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        #[cfg(feature = "encryption")]
        {
            if let Ok(key) = std::env::var("CLASSWATCH_ENCRYPTION_KEY") {
                if !key.is_empty() {
                    conn.pragma_update(None, "key", &key)?;
                }
            }
        }

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        Ok(())
    }

    /// Create new storage instance. `None` uses the platform data directory.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("com", "classwatch", "server").ok_or_else(|| {
                    StorageError::Init("Could not determine project directories".to_string())
                })?;

                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o700);
                    let _ = std::fs::set_permissions(data_dir, perms);
                }
                data_dir.join("classwatch.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;

        // Apply migrations on writer only
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        tracing::debug!(path = %path.display(), "Storage opened");

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Init("Writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StorageError::Init("Reader lock poisoned".into()))
    }

    fn parse_timestamp(value: &str, field_name: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Invalid {} timestamp '{}': {}", field_name, value, e),
                    )),
                )
            })
    }

    fn invalid_text(field_name: &str, value: &str) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid {} '{}'", field_name, value),
            )),
        )
    }

    /// Convert a row to Session
    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        let status: String = row.get("status")?;
        let status = SessionStatus::parse_name(&status)
            .ok_or_else(|| Self::invalid_text("status", &status))?;

        let created_at: String = row.get("created_at")?;
        let started_at: Option<String> = row.get("started_at")?;
        let completed_at: Option<String> = row.get("completed_at")?;

        let counters: String = row.get("counters")?;
        let counters: EventCounters = serde_json::from_str(&counters).unwrap_or_default();

        Ok(Session {
            id: row.get("id")?,
            name: row.get("name")?,
            course_name: row.get("course_name")?,
            room_number: row.get("room_number")?,
            description: row.get("description")?,
            owner_id: row.get("owner_id")?,
            status,
            created_at: Self::parse_timestamp(&created_at, "created_at")?,
            started_at: started_at
                .map(|s| Self::parse_timestamp(&s, "started_at"))
                .transpose()?,
            completed_at: completed_at
                .map(|s| Self::parse_timestamp(&s, "completed_at"))
                .transpose()?,
            duration_seconds: row.get("duration_seconds")?,
            peak_students: row.get("peak_students")?,
            counters,
        })
    }

    /// Convert a row to DetectionEvent
    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<DetectionEvent> {
        let kind: String = row.get("event_type")?;
        let kind = EventKind::parse_name(&kind).ok_or_else(|| Self::invalid_text("event_type", &kind))?;
        let timestamp: String = row.get("timestamp")?;
        let details: String = row.get("details")?;

        Ok(DetectionEvent {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            subject: SubjectRef {
                track_id: row.get("track_id")?,
                student_id: row.get("student_id")?,
                student_name: row.get("student_name")?,
            },
            kind,
            confidence: row.get("confidence")?,
            timestamp: Self::parse_timestamp(&timestamp, "timestamp")?,
            details: serde_json::from_str(&details).unwrap_or_default(),
        })
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    pub fn create_session(&self, session: &Session) -> Result<()> {
        let counters = serde_json::to_string(&session.counters)?;
        let writer = self.writer()?;
        writer.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS}, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                session.id,
                session.name,
                session.course_name,
                session.room_number,
                session.description,
                session.owner_id,
                session.status.as_str(),
                session.created_at.to_rfc3339(),
                session.started_at.map(|t| t.to_rfc3339()),
                session.completed_at.map(|t| t.to_rfc3339()),
                session.duration_seconds,
                session.peak_students,
                counters,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let reader = self.reader()?;
        let session = reader
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                Self::row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Newest first, optionally filtered by status.
    pub fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Session>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC
             LIMIT ?2"
        ))?;
        let sessions = stmt
            .query_map(params![status.map(|s| s.as_str()), limit], Self::row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Persist lifecycle fields after a transition.
    pub fn update_session_lifecycle(&self, session: &Session) -> Result<()> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE sessions
             SET status = ?2, started_at = ?3, completed_at = ?4, duration_seconds = ?5,
                 updated_at = ?6
             WHERE id = ?1",
            params![
                session.id,
                session.status.as_str(),
                session.started_at.map(|t| t.to_rfc3339()),
                session.completed_at.map(|t| t.to_rfc3339()),
                session.duration_seconds,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(session.id.clone()));
        }
        Ok(())
    }

    /// Persist running counters and the latest live snapshot.
    pub fn update_session_progress(
        &self,
        id: &str,
        counters: &EventCounters,
        peak_students: u32,
        live: &LiveMetrics,
    ) -> Result<()> {
        let counters = serde_json::to_string(counters)?;
        let live = serde_json::to_string(live)?;
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE sessions
             SET counters = ?2, peak_students = MAX(peak_students, ?3), live_snapshot = ?4,
                 updated_at = ?5
             WHERE id = ?1",
            params![id, counters, peak_students, live, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn get_live_snapshot(&self, id: &str) -> Result<Option<LiveMetrics>> {
        let reader = self.reader()?;
        let raw: Option<Option<String>> = reader
            .query_row(
                "SELECT live_snapshot FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn save_report(&self, id: &str, report: &FinalReport) -> Result<()> {
        let json = serde_json::to_string(report)?;
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE sessions SET final_report = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, json, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn get_report(&self, id: &str) -> Result<Option<FinalReport>> {
        let reader = self.reader()?;
        let raw: Option<Option<String>> = reader
            .query_row(
                "SELECT final_report FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Delete a session; its events go with it.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let writer = self.writer()?;
        let deleted = writer.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    fn insert_event_with(conn: &Connection, event: &DetectionEvent) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO events ({EVENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                event.id,
                event.session_id,
                event.subject.track_id,
                event.subject.student_id,
                event.subject.student_name,
                event.kind.as_str(),
                event.confidence,
                event.timestamp.to_rfc3339(),
                serde_json::to_string(&event.details)?,
            ],
        )?;
        Ok(())
    }

    /// Append a batch in one transaction.
    pub fn insert_events(&self, events: &[DetectionEvent]) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        for event in events {
            Self::insert_event_with(&tx, event)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All events of a session in arrival order.
    pub fn list_events(&self, session_id: &str) -> Result<Vec<DetectionEvent>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE session_id = ?1 ORDER BY seq ASC"
        ))?;
        let events = stmt
            .query_map(params![session_id], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn count_events(&self, session_id: &str) -> Result<u64> {
        let reader = self.reader()?;
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn get_stats(&self) -> Result<StorageStats> {
        let reader = self.reader()?;
        let (total_sessions, active_sessions): (i64, i64) = reader.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0)
             FROM sessions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let total_events: i64 =
            reader.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;

        Ok(StorageStats {
            total_sessions: total_sessions as u64,
            active_sessions: active_sessions as u64,
            total_events: total_events as u64,
        })
    }
}
