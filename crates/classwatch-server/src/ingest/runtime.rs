//! In-memory state of sessions that are being ingested into.
//!
//! One async mutex per session: holding it serializes that session's
//! ingest, lifecycle changes and broadcasts, and never blocks another
//! session. The table lock is only held to look up or reserve a slot;
//! rebuilding a runtime from the event log happens outside it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell, RwLock};

use classwatch_core::storage::Result;
use classwatch_core::{LiveAggregator, Session, Storage};

pub struct SessionRuntime {
    pub session: Session,
    pub live: LiveAggregator,
}

impl SessionRuntime {
    /// Rebuild from the persisted record and event log.
    pub fn load(storage: &Storage, session_id: &str) -> Result<Option<Self>> {
        let Some(session) = storage.get_session(session_id)? else {
            return Ok(None);
        };
        let events = storage.list_events(session_id)?;
        let live = LiveAggregator::from_events(&events).with_peak(session.peak_students);
        tracing::debug!(
            session_id,
            events = events.len(),
            "Session runtime rebuilt from event log"
        );
        Ok(Some(Self { session, live }))
    }

    /// The session record with in-memory counters applied.
    pub fn current(&self) -> Session {
        let mut session = self.session.clone();
        session.counters = self.live.counters();
        session.peak_students = session.peak_students.max(self.live.peak_students());
        session
    }

    /// Write counters, peak and the live snapshot through to storage.
    pub fn persist(&self, storage: &Storage) -> Result<()> {
        storage.update_session_progress(
            &self.session.id,
            &self.live.counters(),
            self.live.peak_students(),
            &self.live.snapshot(),
        )
    }
}

pub type SharedRuntime = Arc<Mutex<SessionRuntime>>;

/// A table slot; empty while its runtime is still being rebuilt.
type Slot = Arc<OnceCell<SharedRuntime>>;

#[derive(Default)]
pub struct RuntimeTable {
    entries: RwLock<HashMap<String, Slot>>,
}

impl RuntimeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The runtime for `session_id` if it is loaded. A slot still being
    /// rebuilt counts as not loaded.
    pub async fn get(&self, session_id: &str) -> Option<SharedRuntime> {
        self.entries
            .read()
            .await
            .get(session_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Loaded runtime for `session_id`, rebuilding it on first touch.
    /// `None` when the session does not exist.
    pub async fn get_or_load(&self, storage: &Storage, session_id: &str) -> Result<Option<SharedRuntime>> {
        self.get_or_init_with(session_id, || async move { SessionRuntime::load(storage, session_id) })
            .await
    }

    async fn get_or_init_with<F, Fut>(&self, session_id: &str, init: F) -> Result<Option<SharedRuntime>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<SessionRuntime>>>,
    {
        let slot = self.slot(session_id).await;
        let loaded = slot
            .get_or_try_init(|| async move {
                match init().await {
                    Ok(Some(runtime)) => Ok(Arc::new(Mutex::new(runtime))),
                    Ok(None) => Err(None),
                    Err(e) => Err(Some(e)),
                }
            })
            .await;

        match loaded {
            Ok(runtime) => Ok(Some(Arc::clone(runtime))),
            Err(failure) => {
                self.release(session_id, &slot).await;
                match failure {
                    None => Ok(None),
                    Some(e) => Err(e),
                }
            }
        }
    }

    /// Existing slot for `session_id`, or a fresh empty one.
    async fn slot(&self, session_id: &str) -> Slot {
        if let Some(slot) = self.entries.read().await.get(session_id) {
            return Arc::clone(slot);
        }
        let mut entries = self.entries.write().await;
        Arc::clone(entries.entry(session_id.to_string()).or_default())
    }

    /// Drop `slot` from the table if it is still the one registered.
    async fn release(&self, session_id: &str, slot: &Slot) {
        let mut entries = self.entries.write().await;
        if entries.get(session_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            entries.remove(session_id);
        }
    }

    pub async fn evict(&self, session_id: &str) -> Option<SharedRuntime> {
        self.entries
            .write()
            .await
            .remove(session_id)
            .and_then(|slot| slot.get().cloned())
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use classwatch_core::{EventKind, NewEvent, NewSession, SubjectRef};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn storage_with_sessions(n: usize) -> (Arc<Storage>, Vec<String>, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("rt.db"))).unwrap());
        let ids = (0..n)
            .map(|_| {
                let session = NewSession::default().into_session("u", Utc::now());
                storage.create_session(&session).unwrap();
                session.id
            })
            .collect();
        (storage, ids, dir)
    }

    #[tokio::test]
    async fn test_runtime_rebuilt_from_log() {
        let (storage, ids, _dir) = storage_with_sessions(1);
        let events: Vec<_> = [(EventKind::PhoneDetected, 1), (EventKind::AttentionHigh, 2)]
            .into_iter()
            .map(|(kind, track)| {
                NewEvent::new(kind, 0.9)
                    .with_subject(SubjectRef::track(track))
                    .into_event(&ids[0], Utc::now())
            })
            .collect();
        storage.insert_events(&events).unwrap();

        let table = RuntimeTable::new();
        let runtime = table.get_or_load(&storage, &ids[0]).await.unwrap().unwrap();
        let again = table.get_or_load(&storage, &ids[0]).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&runtime, &again));

        let guard = runtime.lock().await;
        assert_eq!(guard.current().counters.total, 2);
        assert_eq!(guard.live.distinct_subjects(), 2);

        assert!(table.get_or_load(&storage, "missing").await.unwrap().is_none());
        assert_eq!(table.session_ids().await, vec![ids[0].clone()]);
    }

    #[tokio::test]
    async fn test_slow_rebuild_does_not_block_other_sessions() {
        let (storage, ids, _dir) = storage_with_sessions(2);
        let (slow_id, other_id) = (ids[0].clone(), ids[1].clone());
        let table = Arc::new(RuntimeTable::new());
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow = {
            let table = Arc::clone(&table);
            let storage = Arc::clone(&storage);
            let id = slow_id.clone();
            let load_id = slow_id.clone();
            tokio::spawn(async move {
                table
                    .get_or_init_with(&id, move || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        SessionRuntime::load(&storage, &load_id)
                    })
                    .await
                    .map(|runtime| runtime.is_some())
            })
        };
        started_rx.await.unwrap();

        // another session loads and is readable while the first is mid-rebuild
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            table.get_or_load(&storage, &other_id),
        )
        .await
        .expect("other session blocked by a rebuild in progress")
        .unwrap();
        assert!(other.is_some());
        assert!(table.get(&other_id).await.is_some());
        assert!(table.get(&slow_id).await.is_none());
        assert_eq!(table.session_ids().await, vec![other_id.clone()]);

        release_tx.send(()).unwrap();
        assert!(slow.await.unwrap().unwrap());
        assert!(table.get(&slow_id).await.is_some());
    }

    #[tokio::test]
    async fn test_missing_session_leaves_no_slot() {
        let (storage, _ids, _dir) = storage_with_sessions(0);
        let table = RuntimeTable::new();
        assert!(table.get_or_load(&storage, "missing").await.unwrap().is_none());
        assert!(table.entries.read().await.is_empty());
        assert!(table.evict("missing").await.is_none());
    }
}
