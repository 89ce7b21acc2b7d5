// In-memory LRU response cache keyed by (operation, model, canonical_input_hash),
// with TTL (spec.md §4.1). The reference's own `LlmCache` (src/cache/mod.rs) is
// SQL-backed full-response caching for prompt-cache bookkeeping, not a match for
// this requirement; the `lru` crate (already used for an in-memory cache in the
// surrealdb-surrealdb example's Cargo.toml) is used instead.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
}

pub struct GatewayCache<T: Clone> {
    inner: Mutex<LruCache<String, CacheEntry<T>>>,
    ttl: Duration,
}

impl<T: Clone> GatewayCache<T> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        GatewayCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            ttl,
        }
    }

    pub fn key(operation: &str, model: &str, input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        let digest = hasher.finalize();
        format!("{operation}:{model}:{:x}", digest)
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut guard = self.inner.lock();
        let entry = guard.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            guard.pop(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: String, value: T) {
        let mut guard = self.inner.lock();
        guard.put(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_after_ttl() {
        let cache: GatewayCache<Vec<f32>> = GatewayCache::new(4, Duration::from_millis(10));
        let key = GatewayCache::<Vec<f32>>::key("embed", "m", "hello");
        cache.put(key.clone(), vec![1.0, 2.0]);
        assert!(cache.get(&key).is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&key).is_none());
    }
}
