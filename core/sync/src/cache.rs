//! Small TTL cache for resolved policies.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Map whose entries expire `ttl` after they were written.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, (V, Instant)>>,
    ttl: Duration,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Get a live entry; expired entries are dropped on read.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: K, value: V) {
        let expires = Instant::now() + self.ttl;
        self.entries().insert(key, (value, expires));
    }

    /// Remove an entry. Returns whether one was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, (V, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_invalidate() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.set("s1", 1);
        cache.set("s2", 2);

        assert_eq!(cache.get(&"s1"), Some(1));
        assert!(cache.invalidate(&"s1"));
        assert!(!cache.invalidate(&"s1"));
        assert_eq!(cache.get(&"s1"), None);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entries_expire() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.set("s1", "policy");
        assert_eq!(cache.get(&"s1"), Some("policy"));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"s1"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_overwrite_refreshes_value() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.set("s1", 1);
        cache.set("s1", 2);
        assert_eq!(cache.get(&"s1"), Some(2));
        assert_eq!(cache.len(), 1);
    }
}
