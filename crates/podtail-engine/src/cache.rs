use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use podtail_types::PodRecord;

/// Cache key used for the cluster-wide (no namespace) snapshot.
const CLUSTER_KEY: &str = "*";

/// Key/value backend for serialized pod-list snapshots. The default is
/// in-memory; a deployment can plug an external store (the original
/// service used Redis for this) without touching cache semantics.
pub trait SnapshotStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    /// Store `value` unless the key already holds a newer `version`.
    /// The check and the write must be one atomic step (a concurrent
    /// newer write must never be clobbered by an older one). Returns
    /// whether the value was stored.
    fn put_if_newer(&self, key: &str, value: String, version: u64) -> bool;
    fn remove(&self, key: &str);
}

/// Process-local `SnapshotStore`.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (u64, String)>>,
}

impl SnapshotStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).map(|(_, value)| value.clone())
    }

    fn put_if_newer(&self, key: &str, value: String, version: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((existing, _)) if version < *existing => false,
            _ => {
                entries.insert(key.to_string(), (version, value));
                true
            }
        }
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Serialized envelope stored per key. `version` is monotonically
/// non-decreasing; writes carrying an older version are rejected.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    records: Vec<PodRecord>,
    version: u64,
    expires_at: DateTime<Utc>,
}

/// Outcome of a cache read. A miss is a normal fallback signal, not an
/// error.
#[derive(Debug)]
pub enum CacheRead {
    Hit(Vec<PodRecord>),
    Miss,
}

/// TTL-bounded read-through cache for discovery queries.
///
/// Not a source of truth: the registry is always authoritative, and
/// log streaming never reads from here.
pub struct PodCache {
    store: Arc<dyn SnapshotStore>,
    ttl: Duration,
}

impl PodCache {
    pub fn new(store: Arc<dyn SnapshotStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(namespace: Option<&str>) -> &str {
        namespace.unwrap_or(CLUSTER_KEY)
    }

    /// Cached snapshot for the namespace, if present and fresh.
    pub fn get(&self, namespace: Option<&str>) -> CacheRead {
        let key = Self::key(namespace);
        let Some(raw) = self.store.get(key) else {
            return CacheRead::Miss;
        };
        let Ok(entry) = serde_json::from_str::<CacheEntry>(&raw) else {
            // Unreadable payloads are dropped rather than served.
            self.store.remove(key);
            return CacheRead::Miss;
        };
        if Utc::now() < entry.expires_at {
            CacheRead::Hit(entry.records)
        } else {
            CacheRead::Miss
        }
    }

    /// Store a snapshot unless a newer version is already present.
    /// The version check lives inside the store so it stays atomic
    /// with the write.
    pub fn put(&self, namespace: Option<&str>, records: Vec<PodRecord>, version: u64) {
        let key = Self::key(namespace);
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CacheEntry {
            records,
            version,
            expires_at,
        };
        match serde_json::to_string(&entry) {
            Ok(raw) => {
                if !self.store.put_if_newer(key, raw, version) {
                    tracing::debug!(key, version, "stale cache put rejected");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "failed to serialize cache entry"),
        }
    }

    /// Drop the namespace's snapshot. The cluster-wide snapshot covers
    /// every namespace, so it goes too.
    pub fn invalidate(&self, namespace: Option<&str>) {
        self.store.remove(Self::key(namespace));
        if namespace.is_some() {
            self.store.remove(CLUSTER_KEY);
        }
    }
}
