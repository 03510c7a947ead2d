//! In-memory cache owned by one [`crate::guard::ProviderGuard`], with
//! optional atomic tmp-file + rename persistence to disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// A cached response: body bytes, status, headers, and PIT tokens extracted
/// from the response for conditional-request support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub body: Vec<u8>,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub inserted_at: DateTime<Utc>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl_ms: i64) -> bool {
        let age_ms = (now - self.inserted_at).num_milliseconds();
        age_ms < ttl_ms
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.inserted_at
    }
}

/// Reader-writer-locked cache map keyed by cache-key, with optional disk
/// persistence. Reads never block each other; writes are last-writer-wins.
pub struct Cache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    disk_path: Option<PathBuf>,
}

impl Cache {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()), disk_path: None }
    }

    pub fn with_disk_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_from_disk(&path).unwrap_or_default();
        Self { entries: RwLock::new(entries), disk_path: Some(path) }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).get(key).cloned()
    }

    pub fn put(&self, key: impl Into<String>, entry: CacheEntry) {
        {
            let mut guard = self.entries.write().unwrap_or_else(|p| p.into_inner());
            guard.insert(key.into(), entry);
        }
        self.persist_best_effort();
    }

    /// 304 refresh: body/headers/PIT tokens are unchanged, only `inserted_at` moves.
    pub fn refresh_inserted_at(&self, key: &str, now: DateTime<Utc>) {
        {
            let mut guard = self.entries.write().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = guard.get_mut(key) {
                entry.inserted_at = now;
            }
        }
        self.persist_best_effort();
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.write().unwrap_or_else(|p| p.into_inner()).remove(key);
    }

    /// Removes entries whose freshness has expired, bounded to `batch_size`
    /// removals per call so the write lock is never held long enough to
    /// starve concurrent readers.
    pub fn sweep_expired(&self, now: DateTime<Utc>, ttl_ms: i64, batch_size: usize) -> usize {
        let expired_keys: Vec<String> = {
            let guard = self.entries.read().unwrap_or_else(|p| p.into_inner());
            guard
                .iter()
                .filter(|(_, entry)| !entry.is_fresh(now, ttl_ms))
                .take(batch_size)
                .map(|(k, _)| k.clone())
                .collect()
        };
        if expired_keys.is_empty() {
            return 0;
        }
        {
            let mut guard = self.entries.write().unwrap_or_else(|p| p.into_inner());
            for key in &expired_keys {
                guard.remove(key);
            }
        }
        self.persist_best_effort();
        expired_keys.len()
    }

    fn persist_best_effort(&self) {
        let Some(path) = &self.disk_path else { return };
        let snapshot = self.entries.read().unwrap_or_else(|p| p.into_inner()).clone();
        if let Err(err) = save_to_disk(path, &snapshot) {
            tracing::warn!(error = %err, path = %path.display(), "cache: failed to persist to disk");
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

fn load_from_disk(path: &Path) -> Option<HashMap<String, CacheEntry>> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(map) => Some(map),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "cache: dropping unreadable file, starting empty");
            None
        }
    }
}

fn save_to_disk(path: &Path, entries: &HashMap<String, CacheEntry>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let serialized = serde_json::to_vec(entries)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &[u8], inserted_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            body: body.to_vec(),
            status: 200,
            headers: HashMap::new(),
            inserted_at,
            etag: None,
            last_modified: None,
        }
    }

    #[test]
    fn round_trip_returns_identical_body() {
        let cache = Cache::new();
        let now = Utc::now();
        cache.put("key", entry(b"payload", now));
        let fetched = cache.get("key").unwrap();
        assert_eq!(fetched.body, b"payload");
    }

    #[test]
    fn freshness_boundary() {
        let now = Utc::now();
        let e = entry(b"x", now - chrono::Duration::milliseconds(5000));
        assert!(!e.is_fresh(now, 5000));
        assert!(e.is_fresh(now, 5001));
    }

    #[test]
    fn refresh_inserted_at_preserves_body() {
        let cache = Cache::new();
        let now = Utc::now();
        cache.put("key", entry(b"payload", now - chrono::Duration::seconds(10)));
        let later = now + chrono::Duration::seconds(1);
        cache.refresh_inserted_at("key", later);
        let refreshed = cache.get("key").unwrap();
        assert_eq!(refreshed.body, b"payload");
        assert_eq!(refreshed.inserted_at, later);
    }

    #[test]
    fn sweep_expired_removes_stale_entries_only() {
        let cache = Cache::new();
        let now = Utc::now();
        cache.put("fresh", entry(b"a", now));
        cache.put("stale", entry(b"b", now - chrono::Duration::seconds(100)));
        let removed = cache.sweep_expired(now, 5000, 10);
        assert_eq!(removed, 1);
        assert!(cache.get("fresh").is_some());
        assert!(cache.get("stale").is_none());
    }

    #[test]
    fn disk_persistence_round_trips_and_drops_corrupt_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");

        let cache = Cache::with_disk_path(&path);
        let now = Utc::now();
        cache.put("key", entry(b"payload", now));

        let reopened = Cache::with_disk_path(&path);
        assert_eq!(reopened.get("key").unwrap().body, b"payload");

        std::fs::write(&path, b"not json").unwrap();
        let dropped = Cache::with_disk_path(&path);
        assert!(dropped.get("key").is_none());
    }
}
