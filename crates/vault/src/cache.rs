//! TTL cache for vault material.
//!
//! Decrypted keys are cached for minutes, encrypted payloads for longer.
//! Both caches are invalidated whenever a record's access-control list
//! changes, so a revoked holder never sees a stale cached key.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, inserted)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.lock().insert(key, (value, Instant::now()));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_within_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("k", 42);
        assert_eq!(cache.get(&"k"), Some(42));
    }

    #[test]
    fn test_miss_after_ttl() {
        let cache = TtlCache::new(Duration::from_millis(0));
        cache.insert("k", 42);
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn test_invalidate() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("k", 42);
        cache.invalidate(&"k");
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn test_unknown_key() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(&"missing"), None);
    }
}
