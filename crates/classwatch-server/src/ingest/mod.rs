//! Event Ingest
//!
//! Validates, persists and fans out detection events, and drives the
//! session lifecycle. Single and batch ingest share one path, so N single
//! calls and one batch of N leave identical persisted state and counters.
//!
//! Everything that touches a session happens under that session's runtime
//! lock, in this order: check state, persist, update counters, broadcast.

pub mod cache;
pub mod flusher;
pub mod runtime;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use classwatch_core::storage::StorageError;
use classwatch_core::{
    CategoryBreakdown, DetectionEvent, FinalReport, LiveMetrics, MAX_TIMELINE_INTERVAL_MS,
    NewEvent, NewSession, ProducerMetrics, Session, SessionAction, SessionStatus, Storage,
    SubjectMetric, TimelineBucket, TransitionError,
};
use classwatch_core::analytics::{category_breakdown, subject_metrics, timeline};

use crate::engine::{AnalysisEngine, EngineError};
use crate::hub::BroadcastHub;
use crate::messages::ServerMessage;
use cache::{CacheKey, CachedQuery, QueryKind, ReportCache};
use flusher::CounterFlusher;
use runtime::{RuntimeTable, SessionRuntime};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session {session_id} is {status}, not running")]
    SessionNotRunning {
        session_id: String,
        status: SessionStatus,
    },
    #[error("Invalid event at index {index}: {message}")]
    InvalidEvent { index: usize, message: String },
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("Analysis engine unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub flush_delay: Duration,
    pub engine_timeout: Duration,
    pub timeline_interval_ms: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(2000),
            engine_timeout: Duration::from_millis(3000),
            timeline_interval_ms: classwatch_core::DEFAULT_TIMELINE_INTERVAL_MS,
        }
    }
}

pub struct IngestPipeline {
    storage: Arc<Storage>,
    hub: Arc<BroadcastHub>,
    engine: Option<Arc<dyn AnalysisEngine>>,
    runtimes: Arc<RuntimeTable>,
    flusher: CounterFlusher,
    cache: ReportCache,
    config: IngestConfig,
}

impl IngestPipeline {
    /// Must be called inside a tokio runtime; spawns the counter flusher.
    pub fn new(
        storage: Arc<Storage>,
        hub: Arc<BroadcastHub>,
        engine: Option<Arc<dyn AnalysisEngine>>,
        config: IngestConfig,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let runtimes = Arc::new(RuntimeTable::new());
        let (flusher, handle) =
            CounterFlusher::spawn(Arc::clone(&storage), Arc::clone(&runtimes), config.flush_delay);
        let pipeline = Arc::new(Self {
            storage,
            hub,
            engine,
            runtimes,
            flusher,
            cache: ReportCache::default(),
            config,
        });
        (pipeline, handle)
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn timeline_interval_ms(&self) -> i64 {
        self.config.timeline_interval_ms
    }

    async fn runtime(&self, session_id: &str) -> Result<runtime::SharedRuntime> {
        self.runtimes
            .get_or_load(&self.storage, session_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))
    }

    fn ensure_running(runtime: &SessionRuntime) -> Result<()> {
        if runtime.session.status.accepts_events() {
            Ok(())
        } else {
            Err(IngestError::SessionNotRunning {
                session_id: runtime.session.id.clone(),
                status: runtime.session.status,
            })
        }
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    pub fn create_session(&self, owner_id: &str, input: NewSession) -> Result<Session> {
        let session = input.into_session(owner_id, Utc::now());
        self.storage.create_session(&session)?;
        tracing::info!(session_id = %session.id, owner_id, "Session created");
        Ok(session)
    }

    /// Latest in-memory view when the session is loaded, else the stored record.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        if let Some(runtime) = self.runtimes.get(session_id).await {
            return Ok(runtime.lock().await.current());
        }
        self.storage
            .get_session(session_id)?
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))
    }

    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Session>> {
        let mut sessions = self.storage.list_sessions(status, limit)?;
        for session in &mut sessions {
            if let Some(runtime) = self.runtimes.get(&session.id).await {
                *session = runtime.lock().await.current();
            }
        }
        Ok(sessions)
    }

    /// Delete a session and its events. Existing subscriptions are left
    /// alone; they simply stop receiving updates.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let runtime = self.runtimes.evict(session_id).await;
        let _guard = match &runtime {
            Some(runtime) => Some(runtime.lock().await),
            None => None,
        };
        let deleted = self.storage.delete_session(session_id)?;
        self.cache.invalidate_session(session_id);
        if deleted {
            tracing::info!(session_id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Apply a lifecycle action, persist it at once and broadcast
    /// `session_status`. Completing also builds and stores the final report.
    pub async fn transition(&self, session_id: &str, action: SessionAction) -> Result<Session> {
        let runtime = self.runtime(session_id).await?;
        let mut guard = runtime.lock().await;

        let from = guard.session.status;
        let mut next = guard.session.clone();
        let status = next.transition(action, Utc::now())?;
        self.storage.update_session_lifecycle(&next)?;
        guard.session = next;
        tracing::info!(session_id, from = %from, to = %status, "Session transition");

        if status.is_terminal() {
            guard.persist(&self.storage)?;
            if status == SessionStatus::Completed {
                self.store_final_report(&guard).await?;
            }
        }

        self.hub
            .broadcast(session_id, &ServerMessage::session_status(session_id, status))
            .await;

        let session = guard.current();
        drop(guard);
        if status.is_terminal() {
            self.runtimes.evict(session_id).await;
        }
        Ok(session)
    }

    async fn store_final_report(&self, runtime: &SessionRuntime) -> Result<FinalReport> {
        let session = runtime.current();
        let events = self.storage.list_events(&session.id)?;
        let mut report =
            FinalReport::build(&session, &events, self.config.timeline_interval_ms, Utc::now());

        if let Some(engine) = &self.engine {
            match self.bounded(engine.complete_session(&session.id)).await {
                Ok(Some(external)) => {
                    report.merge_external(&external);
                    tracing::debug!(session_id = %session.id, "Engine analytics merged into report");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    session_id = %session.id,
                    "Final report built without engine analytics: {}",
                    e
                ),
            }
        }

        self.storage.save_report(&session.id, &report)?;
        Ok(report)
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = std::result::Result<T, EngineError>>,
    ) -> std::result::Result<T, EngineError> {
        match tokio::time::timeout(self.config.engine_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.config.engine_timeout)),
        }
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    pub async fn ingest_one(&self, session_id: &str, event: NewEvent) -> Result<DetectionEvent> {
        event
            .validate()
            .map_err(|e| IngestError::InvalidEvent {
                index: 0,
                message: e.to_string(),
            })?;
        let event = event.into_event(session_id, Utc::now());
        self.commit(session_id, std::slice::from_ref(&event)).await?;
        Ok(event)
    }

    /// All-or-nothing validation, then persist in input order and broadcast
    /// one `live_metrics` followed by one `event` per new event.
    pub async fn ingest_batch(
        &self,
        session_id: &str,
        events: Vec<NewEvent>,
    ) -> Result<Vec<DetectionEvent>> {
        let now = Utc::now();
        for (index, event) in events.iter().enumerate() {
            event.validate_at(now).map_err(|e| IngestError::InvalidEvent {
                index,
                message: e.to_string(),
            })?;
        }
        let created: Vec<DetectionEvent> = events
            .into_iter()
            .map(|event| event.into_event(session_id, now))
            .collect();
        self.commit(session_id, &created).await?;
        Ok(created)
    }

    /// Shared tail of single and batch ingest: under the session lock,
    /// check state, persist, count, broadcast.
    async fn commit(&self, session_id: &str, created: &[DetectionEvent]) -> Result<()> {
        let runtime = self.runtime(session_id).await?;
        let mut guard = runtime.lock().await;
        Self::ensure_running(&guard)?;
        if created.is_empty() {
            return Ok(());
        }

        self.storage.insert_events(created)?;
        for event in created {
            guard.live.record(event);
        }
        self.flusher.mark(session_id);

        self.hub
            .broadcast(session_id, &ServerMessage::live_metrics(session_id, guard.live.snapshot()))
            .await;
        for event in created {
            self.hub.broadcast(session_id, &ServerMessage::event(event)).await;
        }

        tracing::debug!(session_id, count = created.len(), "Events ingested");
        Ok(())
    }

    /// Metrics pushed by the engine (or forwarded over a socket).
    pub async fn ingest_metrics(
        &self,
        session_id: &str,
        metrics: &ProducerMetrics,
    ) -> Result<LiveMetrics> {
        let runtime = self.runtime(session_id).await?;
        let mut guard = runtime.lock().await;
        Self::ensure_running(&guard)?;

        guard.live.apply_producer(metrics);
        let snapshot = guard.live.snapshot();
        self.flusher.mark(session_id);
        self.hub
            .broadcast(session_id, &ServerMessage::live_metrics(session_id, snapshot.clone()))
            .await;
        Ok(snapshot)
    }

    /// Broadcast a locally synthesized snapshot marked degraded, for when
    /// the engine could not supply one.
    pub async fn ingest_fallback(&self, session_id: &str, reason: &str) -> Result<LiveMetrics> {
        let runtime = self.runtime(session_id).await?;
        let guard = runtime.lock().await;
        Self::ensure_running(&guard)?;

        let snapshot = guard.live.degraded_snapshot(reason);
        self.hub
            .broadcast(session_id, &ServerMessage::live_metrics(session_id, snapshot.clone()))
            .await;
        Ok(snapshot)
    }

    /// Ask the engine for fresh metrics within the engine timeout; degrade
    /// to the local snapshot on failure.
    pub async fn refresh_from_engine(
        &self,
        session_id: &str,
        engine: &dyn AnalysisEngine,
    ) -> Result<LiveMetrics> {
        match self.bounded(engine.session_metrics(session_id)).await {
            Ok(metrics) => self.ingest_metrics(session_id, &metrics).await,
            Err(e) => {
                let reason = IngestError::UpstreamUnavailable(e.to_string()).to_string();
                tracing::warn!(session_id, "{}", reason);
                self.ingest_fallback(session_id, &reason).await
            }
        }
    }

    pub fn running_session_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list_sessions(Some(SessionStatus::Running), None)?
            .into_iter()
            .map(|s| s.id)
            .collect())
    }

    pub async fn live_metrics(&self, session_id: &str) -> Result<LiveMetrics> {
        let runtime = self.runtime(session_id).await?;
        let snapshot = runtime.lock().await.live.snapshot();
        Ok(snapshot)
    }

    /// Write pending progress for every loaded session now.
    pub async fn flush(&self) -> usize {
        let mut written = self.flusher.flush_all().await;
        for session_id in self.runtimes.session_ids().await {
            if let Some(runtime) = self.runtimes.get(&session_id).await {
                match runtime.lock().await.persist(&self.storage) {
                    Ok(()) => written += 1,
                    Err(e) => tracing::warn!(session_id = %session_id, "Shutdown flush failed: {}", e),
                }
            }
        }
        written
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    fn cache_key(&self, session_id: &str, query: QueryKind, interval_ms: i64) -> Result<CacheKey> {
        if self.storage.get_session(session_id)?.is_none() {
            return Err(IngestError::NotFound(session_id.to_string()));
        }
        Ok(CacheKey {
            session_id: session_id.to_string(),
            query,
            interval_ms,
            event_count: self.storage.count_events(session_id)?,
        })
    }

    fn cached(
        &self,
        key: CacheKey,
        compute: impl FnOnce(&[DetectionEvent]) -> CachedQuery,
    ) -> Result<CachedQuery> {
        let mut failure = None;
        let value = self.cache.get_or_compute(key.clone(), || match self.storage.list_events(&key.session_id) {
            Ok(events) => compute(&events),
            Err(e) => {
                failure = Some(e);
                CachedQuery::Timeline(Arc::new(Vec::new()))
            }
        });
        match failure {
            Some(e) => {
                self.cache.invalidate_session(&key.session_id);
                Err(e.into())
            }
            None => Ok(value),
        }
    }

    pub fn timeline(&self, session_id: &str, interval_ms: Option<i64>) -> Result<Arc<Vec<TimelineBucket>>> {
        let interval_ms = interval_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.config.timeline_interval_ms)
            .min(MAX_TIMELINE_INTERVAL_MS);
        let key = self.cache_key(session_id, QueryKind::Timeline, interval_ms)?;
        match self.cached(key, |events| {
            CachedQuery::Timeline(Arc::new(timeline(events, interval_ms)))
        })? {
            CachedQuery::Timeline(buckets) => Ok(buckets),
            _ => Ok(Arc::new(Vec::new())),
        }
    }

    pub fn category_breakdown(&self, session_id: &str) -> Result<Arc<Vec<CategoryBreakdown>>> {
        let key = self.cache_key(session_id, QueryKind::Categories, 0)?;
        match self.cached(key, |events| {
            CachedQuery::Categories(Arc::new(category_breakdown(events)))
        })? {
            CachedQuery::Categories(categories) => Ok(categories),
            _ => Ok(Arc::new(Vec::new())),
        }
    }

    pub fn subject_metrics(&self, session_id: &str) -> Result<Arc<Vec<SubjectMetric>>> {
        let key = self.cache_key(session_id, QueryKind::Subjects, 0)?;
        match self.cached(key, |events| {
            CachedQuery::Subjects(Arc::new(subject_metrics(events)))
        })? {
            CachedQuery::Subjects(subjects) => Ok(subjects),
            _ => Ok(Arc::new(Vec::new())),
        }
    }

    /// The stored final report, or a provisional one for sessions that have
    /// not completed yet.
    pub async fn report(&self, session_id: &str) -> Result<FinalReport> {
        if let Some(report) = self.storage.get_report(session_id)? {
            return Ok(report);
        }
        let session = self.get_session(session_id).await?;
        let events = self.storage.list_events(session_id)?;
        Ok(FinalReport::build(
            &session,
            &events,
            self.config.timeline_interval_ms,
            Utc::now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::FakeEngine;
    use crate::hub::tests::StaticDirectory;
    use crate::hub::{Outbound, SessionDirectory};
    use classwatch_core::{EventKind, ExternalAnalytics, SubjectRef};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        pipeline: Arc<IngestPipeline>,
        _dir: TempDir,
    }

    fn fixture_with(engine: Option<Arc<dyn AnalysisEngine>>, config: IngestConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("ingest.db"))).unwrap());
        let (pipeline, _handle) = IngestPipeline::new(storage, BroadcastHub::new(), engine, config);
        Fixture { pipeline, _dir: dir }
    }

    fn fixture() -> Fixture {
        fixture_with(None, IngestConfig::default())
    }

    async fn running_session(pipeline: &IngestPipeline) -> String {
        let session = pipeline
            .create_session("teacher-1", NewSession::default())
            .unwrap();
        pipeline
            .transition(&session.id, SessionAction::Start)
            .await
            .unwrap();
        session.id
    }

    fn texts(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Text(text) = msg {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn sample_events() -> Vec<NewEvent> {
        vec![
            NewEvent::new(EventKind::AttentionHigh, 0.8).with_subject(SubjectRef::track(1)),
            NewEvent::new(EventKind::PhoneDetected, 0.92).with_subject(SubjectRef::track(2)),
            NewEvent::new(EventKind::AttentionLow, 0.6).with_subject(SubjectRef::track(1)),
        ]
    }

    #[tokio::test]
    async fn test_single_and_batch_converge() {
        let one = fixture();
        let batch = fixture();
        let a = running_session(&one.pipeline).await;
        let b = running_session(&batch.pipeline).await;

        for event in sample_events() {
            one.pipeline.ingest_one(&a, event).await.unwrap();
        }
        batch.pipeline.ingest_batch(&b, sample_events()).await.unwrap();

        one.pipeline.flush().await;
        batch.pipeline.flush().await;

        let sa = one.pipeline.storage().get_session(&a).unwrap().unwrap();
        let sb = batch.pipeline.storage().get_session(&b).unwrap().unwrap();
        assert_eq!(sa.counters, sb.counters);
        assert_eq!(sa.counters.total, 3);

        let kinds = |p: &IngestPipeline, id: &str| {
            p.storage()
                .list_events(id)
                .unwrap()
                .into_iter()
                .map(|e| (e.kind, e.subject, e.confidence))
                .collect::<Vec<_>>()
        };
        assert_eq!(kinds(&one.pipeline, &a), kinds(&batch.pipeline, &b));
    }

    #[tokio::test]
    async fn test_rejects_when_not_running() {
        let fx = fixture();
        let session = fx
            .pipeline
            .create_session("teacher-1", NewSession::default())
            .unwrap();
        let id = session.id;

        let err = fx
            .pipeline
            .ingest_one(&id, NewEvent::new(EventKind::PhoneDetected, 0.9))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SessionNotRunning { status: SessionStatus::Created, .. }));

        fx.pipeline.transition(&id, SessionAction::Start).await.unwrap();
        fx.pipeline.transition(&id, SessionAction::Pause).await.unwrap();
        let err = fx
            .pipeline
            .ingest_batch(&id, sample_events())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SessionNotRunning { status: SessionStatus::Paused, .. }));

        fx.pipeline.transition(&id, SessionAction::Cancel).await.unwrap();
        assert!(fx
            .pipeline
            .ingest_one(&id, NewEvent::new(EventKind::PhoneDetected, 0.9))
            .await
            .is_err());

        assert_eq!(fx.pipeline.storage().count_events(&id).unwrap(), 0);
        assert!(matches!(
            fx.pipeline.ingest_one("missing", NewEvent::new(EventKind::PhoneDetected, 0.9)).await,
            Err(IngestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_batch_persists_nothing() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        let mut events = sample_events();
        events.push(NewEvent::new(EventKind::PosturePoor, 1.5));

        let err = fx.pipeline.ingest_batch(&id, events).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidEvent { index: 3, .. }));
        assert_eq!(fx.pipeline.storage().count_events(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_out_of_window_timestamps_are_rejected() {
        use chrono::TimeZone;
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        let year_one = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        let year_9999 = Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0).unwrap();

        let mut events = sample_events();
        events.push(NewEvent::new(EventKind::PhoneDetected, 0.9).at(year_9999));
        let err = fx.pipeline.ingest_batch(&id, events).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidEvent { index: 3, .. }));

        let err = fx
            .pipeline
            .ingest_one(&id, NewEvent::new(EventKind::PhoneDetected, 0.9).at(year_one))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidEvent { index: 0, .. }));
        assert_eq!(fx.pipeline.storage().count_events(&id).unwrap(), 0);

        // completing still builds a report over what was accepted
        fx.pipeline.ingest_batch(&id, sample_events()).await.unwrap();
        fx.pipeline.transition(&id, SessionAction::Complete).await.unwrap();
        let report = fx.pipeline.report(&id).await.unwrap();
        assert_eq!(report.timeline.iter().map(|b| b.total).sum::<u64>(), 3);
    }

    #[tokio::test]
    async fn test_ingest_one_returns_the_stored_event() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        let event = fx
            .pipeline
            .ingest_one(&id, NewEvent::new(EventKind::PostureGood, 0.7).with_subject(SubjectRef::track(5)))
            .await
            .unwrap();

        let stored = fx.pipeline.storage().list_events(&id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, event.id);
        assert_eq!(stored[0].subject, event.subject);
        assert_eq!(fx.pipeline.live_metrics(&id).await.unwrap().posture_count, 1);
    }

    #[tokio::test]
    async fn test_timeline_clamps_requested_interval() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        fx.pipeline.ingest_batch(&id, sample_events()).await.unwrap();

        let buckets = fx.pipeline.timeline(&id, Some(i64::MAX)).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total, 3);
    }

    #[tokio::test]
    async fn test_phone_event_fans_out_to_subscribers() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        let hub = fx.pipeline.hub();
        let directory: &dyn SessionDirectory = fx.pipeline.storage().as_ref();

        let (a, mut rx_a) = hub.register("teacher-1").await;
        let (b, mut rx_b) = hub.register("teacher-1").await;
        hub.subscribe(&a, &id, directory).await.unwrap();
        hub.subscribe(&b, &id, directory).await.unwrap();

        let t = Utc::now() + chrono::Duration::seconds(10);
        fx.pipeline
            .ingest_one(&id, NewEvent::new(EventKind::PhoneDetected, 0.92).at(t))
            .await
            .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let msgs = texts(rx);
            assert_eq!(msgs.len(), 2);
            assert_eq!(msgs[0]["type"], "live_metrics");
            assert_eq!(msgs[0]["data"]["phoneCount"], 1);
            assert_eq!(msgs[1]["type"], "event");
            assert_eq!(msgs[1]["event"]["eventType"], "phone_detected");
        }

        hub.unsubscribe(b.id()).await;
        fx.pipeline
            .ingest_one(&id, NewEvent::new(EventKind::PhoneDetected, 0.88))
            .await
            .unwrap();
        assert_eq!(texts(&mut rx_a).len(), 2);
        assert!(texts(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_batch_preserves_event_order_in_broadcast() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        let hub = fx.pipeline.hub();
        let (a, mut rx) = hub.register("teacher-1").await;
        let directory = StaticDirectory::default().with(&id, "teacher-1", SessionStatus::Running);
        hub.subscribe(&a, &id, &directory).await.unwrap();

        fx.pipeline.ingest_batch(&id, sample_events()).await.unwrap();
        let kinds: Vec<_> = texts(&mut rx)
            .into_iter()
            .filter(|m| m["type"] == "event")
            .map(|m| m["event"]["eventType"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["attention_high", "phone_detected", "attention_low"]);
    }

    #[tokio::test]
    async fn test_complete_builds_report() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        let events = [
            EventKind::AttentionHigh,
            EventKind::AttentionHigh,
            EventKind::AttentionHigh,
            EventKind::AttentionLow,
            EventKind::PhoneDetected,
            EventKind::PhoneDetected,
        ]
        .into_iter()
        .map(|kind| NewEvent::new(kind, 0.9))
        .collect();
        fx.pipeline.ingest_batch(&id, events).await.unwrap();

        let session = fx.pipeline.transition(&id, SessionAction::Complete).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.counters.phone, 2);

        let report = fx.pipeline.storage().get_report(&id).unwrap().unwrap();
        assert_eq!(report.summary.attention_ratio, Some(0.75));
        assert_eq!(report.summary.phone_count, 2);
        assert!(!report.engine_merged);

        // counters flushed immediately on completion
        let stored = fx.pipeline.storage().get_session(&id).unwrap().unwrap();
        assert_eq!(stored.counters.total, 6);
    }

    #[tokio::test]
    async fn test_complete_merges_engine_analytics() {
        let engine = FakeEngine {
            metrics: None,
            analytics: Some(ExternalAnalytics {
                peak_student_count: Some(21),
                ..Default::default()
            }),
            delay: Duration::ZERO,
        };
        let fx = fixture_with(Some(Arc::new(engine)), IngestConfig::default());
        let id = running_session(&fx.pipeline).await;
        fx.pipeline
            .ingest_one(&id, NewEvent::new(EventKind::StudentEntered, 0.9).with_subject(SubjectRef::track(1)))
            .await
            .unwrap();

        fx.pipeline.transition(&id, SessionAction::Complete).await.unwrap();
        let report = fx.pipeline.report(&id).await.unwrap();
        assert!(report.engine_merged);
        assert_eq!(report.summary.peak_students, 21);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_reported() {
        let fx = fixture();
        let session = fx
            .pipeline
            .create_session("teacher-1", NewSession::default())
            .unwrap();
        let err = fx
            .pipeline
            .transition(&session.id, SessionAction::Resume)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidTransition(_)));
        assert_eq!(
            fx.pipeline.get_session(&session.id).await.unwrap().status,
            SessionStatus::Created
        );
    }

    #[tokio::test]
    async fn test_transition_broadcasts_status() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        let hub = fx.pipeline.hub();
        let (a, mut rx) = hub.register("teacher-1").await;
        hub.subscribe(&a, &id, fx.pipeline.storage().as_ref()).await.unwrap();

        fx.pipeline.transition(&id, SessionAction::Pause).await.unwrap();
        let msgs = texts(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["type"], "session_status");
        assert_eq!(msgs[0]["status"], "paused");
    }

    #[tokio::test]
    async fn test_engine_timeout_degrades() {
        let config = IngestConfig {
            engine_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let fx = fixture_with(None, config);
        let id = running_session(&fx.pipeline).await;
        let hub = fx.pipeline.hub();
        let (a, mut rx) = hub.register("teacher-1").await;
        hub.subscribe(&a, &id, fx.pipeline.storage().as_ref()).await.unwrap();

        let stalled = FakeEngine::stalled(Duration::from_secs(5));
        let snapshot = fx.pipeline.refresh_from_engine(&id, &stalled).await.unwrap();
        assert!(snapshot.degraded);
        assert!(snapshot.degraded_reason.unwrap().contains("timed out"));

        let msgs = texts(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["data"]["degraded"], true);
    }

    #[tokio::test]
    async fn test_engine_metrics_update_live_snapshot() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        let engine = FakeEngine::answering(ProducerMetrics {
            student_count: 17,
            avg_attention: Some(68.0),
            ..Default::default()
        });

        let snapshot = fx.pipeline.refresh_from_engine(&id, &engine).await.unwrap();
        assert!(!snapshot.degraded);
        assert_eq!(snapshot.student_count, 17);
        assert_eq!(fx.pipeline.live_metrics(&id).await.unwrap().peak_students, 17);
    }

    #[tokio::test]
    async fn test_queries_follow_new_events() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        fx.pipeline.ingest_batch(&id, sample_events()).await.unwrap();

        let subjects = fx.pipeline.subject_metrics(&id).unwrap();
        assert_eq!(subjects.len(), 2);
        let categories = fx.pipeline.category_breakdown(&id).unwrap();
        assert_eq!(categories.iter().map(|c| c.count).sum::<u64>(), 3);

        fx.pipeline
            .ingest_one(&id, NewEvent::new(EventKind::PosturePoor, 0.7).with_subject(SubjectRef::track(3)))
            .await
            .unwrap();
        assert_eq!(fx.pipeline.subject_metrics(&id).unwrap().len(), 3);

        let buckets = fx.pipeline.timeline(&id, Some(1000)).unwrap();
        assert_eq!(buckets.iter().map(|b| b.total).sum::<u64>(), 4);

        assert!(matches!(fx.pipeline.timeline("missing", None), Err(IngestError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_session_drops_runtime() {
        let fx = fixture();
        let id = running_session(&fx.pipeline).await;
        fx.pipeline.ingest_batch(&id, sample_events()).await.unwrap();

        assert!(fx.pipeline.delete_session(&id).await.unwrap());
        assert!(matches!(fx.pipeline.get_session(&id).await, Err(IngestError::NotFound(_))));
        assert!(!fx.pipeline.delete_session(&id).await.unwrap());
    }
}
