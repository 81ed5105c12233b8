//! Sticky provider store
//!
//! Remembers the last provider chosen per routing key so that small metric
//! fluctuations do not flip clients between providers. The store is shared
//! by all requests; it is split into independently locked LRU shards and every
//! read-modify-write happens under a single shard lock.

use crate::hash_ring::fnv1a_32;
use crate::lru::LruCache;
use crate::pool::{CandidatePool, Extremum, Metric};
use parking_lot::Mutex;

/// Result of a sticky check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StickyOutcome {
    /// The previous provider is still good enough
    Kept(String),
    /// The new best replaced the previous provider (or there was none)
    Switched {
        /// Previous provider, if any
        from: Option<String>,
        /// Newly stored provider
        to: String,
    },
}

impl StickyOutcome {
    /// Alias to answer with
    pub fn alias(&self) -> &str {
        match self {
            Self::Kept(alias) => alias,
            Self::Switched { to, .. } => to,
        }
    }
}

/// Sharded LRU of routing key -> alias
#[derive(Debug)]
pub struct StickyStore {
    shards: Vec<Mutex<LruCache<String, String>>>,
}

impl StickyStore {
    /// Store holding at most `capacity` keys spread over `shards` locks.
    ///
    /// The shard count is capped at `capacity`; the remainder of the split
    /// goes one slot each to the first shards.
    pub fn new(capacity: usize, shards: usize) -> Self {
        let capacity = capacity.max(1);
        let shards = shards.clamp(1, capacity);
        let (base, extra) = (capacity / shards, capacity % shards);
        Self {
            shards: (0..shards)
                .map(|i| Mutex::new(LruCache::new(base + usize::from(i < extra))))
                .collect(),
        }
    }

    /// Total keys the store can hold
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.lock().capacity()).sum()
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, String>> {
        let idx = fnv1a_32(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Previous alias for `key`, refreshing its recency
    pub fn get(&self, key: &str) -> Option<String> {
        self.shard(key).lock().get(&key.to_string()).cloned()
    }

    /// Record `alias` for `key`
    pub fn set(&self, key: &str, alias: &str) {
        self.shard(key).lock().set(key.to_string(), alias.to_string());
    }

    /// Total remembered keys
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the previous provider for `key` if it is still in `pool` and its
    /// `metric` is within `variance` (relative) of `best`; otherwise store
    /// `best`.
    pub fn decide(
        &self,
        key: &str,
        pool: &CandidatePool,
        best: &str,
        metric: Metric,
        direction: Extremum,
        variance: f64,
    ) -> StickyOutcome {
        let owned_key = key.to_string();
        let mut shard = self.shard(key).lock();
        let previous = shard.get(&owned_key).cloned();

        if let Some(prev) = previous.as_deref() {
            let best_value = pool.get(best).and_then(|c| c.value(metric));
            let prev_value = pool.get(prev).and_then(|c| c.value(metric));
            let keep = prev == best
                || matches!(
                    (prev_value, best_value),
                    (Some(p), Some(b)) if direction.within(p, b, variance)
                );
            if keep {
                return StickyOutcome::Kept(prev.to_string());
            }
        }

        shard.set(owned_key, best.to_string());
        StickyOutcome::Switched {
            from: previous,
            to: best.to_string(),
        }
    }
}

impl Default for StickyStore {
    fn default() -> Self {
        Self::new(10_000, 16)
    }
}
