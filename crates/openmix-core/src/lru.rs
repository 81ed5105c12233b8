//! Fixed-capacity LRU cache
//!
//! Thin wrapper over [`lru::LruCache`] exposing the insert-or-update and
//! recency-listing operations the sticky store and ring cache need.

use std::hash::Hash;
use std::num::NonZeroUsize;

/// Least-recently-used cache with strict eviction order
#[derive(Debug)]
pub struct LruCache<K: Hash + Eq, V> {
    inner: ::lru::LruCache<K, V>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: ::lru::LruCache::new(capacity),
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Check membership without touching recency
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    /// Look up `key`, promoting it to most-recently-used on a hit
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Look up `key` without changing its recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.peek(key)
    }

    /// Insert or update `key`.
    ///
    /// Updating an existing key promotes it in place. Inserting a new key into
    /// a full cache first evicts the least-recently-used entry, which is
    /// returned.
    pub fn set(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.inner.contains(&key) {
            self.inner.put(key, value);
            return None;
        }
        self.inner.push(key, value)
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Keys ordered from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.inner.iter().rev().map(|(key, _)| key.clone()).collect()
    }
}
