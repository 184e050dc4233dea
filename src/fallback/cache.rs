//! In-process cache of which peer last served a repository.
//!
//! Keyed by `(repo_type, namespace, name)` with a TTL; bounded by evicting
//! expired entries first, then the oldest. A plain mutex guards the map;
//! the cache sits off the hot path (only consulted after a local 404).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repo_type: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CachedSource {
    pub source_url: String,
    pub source_name: String,
    pub source_type: String,
}

#[derive(Debug, Clone)]
struct Entry {
    value: CachedSource,
    inserted_at: Instant,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub maxsize: usize,
    pub ttl_seconds: u64,
}

#[derive(Debug)]
pub struct FallbackCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    max_size: usize,
    ttl: Duration,
}

impl FallbackCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedSource> {
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: CacheKey, value: CachedSource) {
        let mut entries = self.entries.lock().expect("cache lock");

        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
            if entries.len() >= self.max_size {
                // Still full: drop the oldest entry.
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(key, _)| key.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock").clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.lock().expect("cache lock").len(),
            maxsize: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey {
            repo_type: "model".into(),
            namespace: "foo".into(),
            name: name.into(),
        }
    }

    fn source(url: &str) -> CachedSource {
        CachedSource {
            source_url: url.into(),
            source_name: "hf".into(),
            source_type: "huggingface".into(),
        }
    }

    #[test]
    fn get_after_set() {
        let cache = FallbackCache::new(10, Duration::from_secs(60));
        cache.set(key("bar"), source("https://huggingface.co"));
        let hit = cache.get(&key("bar")).unwrap();
        assert_eq!(hit.source_url, "https://huggingface.co");
    }

    #[test]
    fn expired_entries_miss() {
        let cache = FallbackCache::new(10, Duration::from_secs(0));
        cache.set(key("bar"), source("https://huggingface.co"));
        assert!(cache.get(&key("bar")).is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = FallbackCache::new(2, Duration::from_secs(60));
        cache.set(key("a"), source("u1"));
        cache.set(key("b"), source("u2"));
        cache.set(key("c"), source("u3"));
        assert!(cache.stats().size <= 2);
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn clear_empties() {
        let cache = FallbackCache::new(10, Duration::from_secs(60));
        cache.set(key("a"), source("u1"));
        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn stats_shape() {
        let cache = FallbackCache::new(7, Duration::from_secs(300));
        let stats = cache.stats();
        assert_eq!(stats.maxsize, 7);
        assert_eq!(stats.ttl_seconds, 300);
        assert_eq!(stats.size, 0);
    }
}
