//! Short-lived cache for idempotent reads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use tracing::trace;

use crate::clock::SharedClock;

/// Entry stored in the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// When this entry was written.
    pub cached_at: DateTime<Utc>,
    /// Parsed response body.
    pub data: Value,
}

/// Keyed, TTL-bound store of successful GET responses.
///
/// Stale entries are dropped lazily when looked up; there is no sweeper,
/// so memory is bounded by the number of distinct keys rather than by time.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    clock: SharedClock,
    ttl: Duration,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish()
    }
}

impl ResponseCache {
    /// Create an empty cache.
    pub fn new(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
            ttl,
        }
    }

    /// Whether responses to `method` may be cached at all.
    pub fn is_cacheable(method: &Method) -> bool {
        *method == Method::GET || *method == Method::HEAD
    }

    /// Deterministic key for a request.
    ///
    /// Headers are sorted by name so insertion order does not matter.
    pub fn key(method: &Method, endpoint: &str, body: Option<&Value>, headers: &HeaderMap) -> String {
        let sorted: BTreeMap<&str, Vec<&str>> =
            headers.keys().fold(BTreeMap::new(), |mut acc, name| {
                let values = headers
                    .get_all(name)
                    .iter()
                    .map(|v| v.to_str().unwrap_or("<binary>"))
                    .collect();
                acc.insert(name.as_str(), values);
                acc
            });
        let body = body.map(Value::to_string).unwrap_or_default();
        let headers = serde_json::to_string(&sorted).unwrap_or_default();
        format!("{method} {endpoint}|{body}|{headers}")
    }

    /// Look up a fresh entry. A stale one is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.get(key)?;

        let age = (now - entry.cached_at).to_std().unwrap_or_default();
        if age >= self.ttl {
            trace!(key, "Cache entry stale");
            entries.remove(key);
            return None;
        }
        Some(entry.data.clone())
    }

    /// Store a response.
    pub fn set(&self, key: impl Into<String>, data: Value) {
        let entry = CacheEntry {
            cached_at: self.clock.now(),
            data,
        };
        self.entries.lock().insert(key.into(), entry);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
