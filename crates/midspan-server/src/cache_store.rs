//! In-memory cache engine.
//!
//! A bounded map of finished objects plus a write-lock set. Storage
//! internals beyond this are out of the proxy core's scope; a persistent
//! engine would implement the same [`CacheEngine`] trait.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use midspan_core::cache::{
    CacheEngine, CacheKey, CacheReadResult, CacheWriteResult, CachedObject,
};
use tracing::debug;

/// Objects kept before the oldest insertions are evicted.
const DEFAULT_CAPACITY: usize = 4096;

/// In-memory [`CacheEngine`].
pub struct MemoryCache {
    objects: Mutex<HashMap<CacheKey, CachedObject>>,
    write_locks: Mutex<HashSet<CacheKey>>,
    capacity: usize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryCache {
    /// Cache bounded to `capacity` objects.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashSet::new()),
            capacity: capacity.max(1),
        }
    }

    /// Objects currently stored.
    #[must_use]
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// True when nothing is stored.
    #[must_use]
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheEngine for MemoryCache {
    fn open_read(&self, key: &CacheKey) -> CacheReadResult {
        let Ok(objects) = self.objects.lock() else {
            return CacheReadResult::Error("cache lock poisoned".into());
        };
        match objects.get(key) {
            Some(object) => CacheReadResult::Hit(object.clone()),
            None => CacheReadResult::Miss,
        }
    }

    fn open_write(&self, key: &CacheKey) -> CacheWriteResult {
        let Ok(mut locks) = self.write_locks.lock() else {
            return CacheWriteResult::Error("cache lock poisoned".into());
        };
        if locks.insert(key.clone()) {
            CacheWriteResult::Ready
        } else {
            CacheWriteResult::LockContended
        }
    }

    fn commit(&self, key: &CacheKey, object: CachedObject) {
        if let Ok(mut locks) = self.write_locks.lock() {
            locks.remove(key);
        }
        let Ok(mut objects) = self.objects.lock() else { return };
        if objects.len() >= self.capacity && !objects.contains_key(key) {
            // Evict an arbitrary entry; a real engine has a policy here
            if let Some(victim) = objects.keys().next().cloned() {
                debug!(%victim, "evicting cached object");
                objects.remove(&victim);
            }
        }
        objects.insert(key.clone(), object);
    }

    fn abort_write(&self, key: &CacheKey) {
        if let Ok(mut locks) = self.write_locks.lock() {
            locks.remove(key);
        }
    }

    fn remove(&self, key: &CacheKey) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.remove(key);
        }
    }
}
