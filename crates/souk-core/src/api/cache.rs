use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Consider cached responses stale after 5 minutes.
/// Listings and profiles change often enough that longer reuse misleads users.
const CACHE_STALE_MINUTES: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn is_stale(&self) -> bool {
        self.age_minutes() >= CACHE_STALE_MINUTES
    }
}

/// In-memory cache of authenticated GET responses, keyed by URL.
///
/// Entries belong to whoever is signed in, so teardown clears the lot.
#[derive(Clone, Default)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, CachedData<serde_json::Value>>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedData<serde_json::Value>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh entry for `key`, if any. Stale entries are evicted on read.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(cached) if !cached.is_stale() => Some(cached.data.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: serde_json::Value) {
        self.lock().insert(key.into(), CachedData::new(value));
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        if !entries.is_empty() {
            debug!(entries = entries.len(), "Clearing response cache");
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_cached_data_is_stale() {
        let fresh = CachedData::new(vec![1]);
        assert!(!fresh.is_stale());

        let mut old = CachedData::new(vec![1]);
        old.cached_at = Utc::now() - Duration::minutes(6);
        assert!(old.is_stale());
    }

    #[test]
    fn test_insert_get_clear() {
        let cache = ResponseCache::new();
        assert!(cache.is_empty());

        cache.insert("https://api.souk.app/api/favorites", json!([1, 2]));
        assert_eq!(cache.get("https://api.souk.app/api/favorites"), Some(json!([1, 2])));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("https://api.souk.app/api/favorites"), None);
    }

    #[test]
    fn test_stale_entry_evicted_on_read() {
        let cache = ResponseCache::new();
        cache.insert("listings", json!({"items": []}));
        cache
            .lock()
            .get_mut("listings")
            .unwrap()
            .cached_at = Utc::now() - Duration::minutes(10);

        assert_eq!(cache.get("listings"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = ResponseCache::new();
        let other = cache.clone();
        cache.insert("me", json!({"id": 1}));
        assert_eq!(other.len(), 1);
        other.clear();
        assert!(cache.is_empty());
    }
}
