//! LRU cache for analytics queries.
//!
//! Keys carry the session's event count, so a new event makes every older
//! entry for that session unreachable without explicit invalidation.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use classwatch_core::{CategoryBreakdown, SubjectMetric, TimelineBucket};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Timeline,
    Categories,
    Subjects,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub session_id: String,
    pub query: QueryKind,
    pub interval_ms: i64,
    pub event_count: u64,
}

#[derive(Debug, Clone)]
pub enum CachedQuery {
    Timeline(Arc<Vec<TimelineBucket>>),
    Categories(Arc<Vec<CategoryBreakdown>>),
    Subjects(Arc<Vec<SubjectMetric>>),
}

pub struct ReportCache {
    inner: Mutex<LruCache<CacheKey, CachedQuery>>,
}

impl Default for ReportCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ReportCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached value for `key`, or compute and remember it. A poisoned lock
    /// just bypasses the cache.
    pub fn get_or_compute(&self, key: CacheKey, compute: impl FnOnce() -> CachedQuery) -> CachedQuery {
        if let Ok(mut cache) = self.inner.lock() {
            if let Some(hit) = cache.get(&key) {
                return hit.clone();
            }
        }
        let value = compute();
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(key, value.clone());
        }
        value
    }

    pub fn invalidate_session(&self, session_id: &str) {
        let Ok(mut cache) = self.inner.lock() else {
            return;
        };
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(key, _)| key.session_id == session_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
