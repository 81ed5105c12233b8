//! Consistent hash ring for sticky session routing
//!
//! Each target is expanded into `replicas` virtual points on a 32-bit ring.
//! A lookup key maps to the first point at or after its own hash, wrapping
//! around to the first point. As long as the target set is unchanged the same
//! key (typically a requester ASN) always lands on the same target.

use crate::lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;

/// 32-bit FNV-1a over the UTF-8 bytes of `input`.
///
/// The shift-and-add form below is the FNV prime multiplication
/// (`0x0100_0193`) spelled out, and must stay bit-exact so that existing
/// ASN-to-provider assignments do not move.
#[inline]
pub fn fnv1a_32(input: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in input.bytes() {
        hash ^= u32::from(byte);
        hash = hash
            .wrapping_add(hash << 1)
            .wrapping_add(hash << 4)
            .wrapping_add(hash << 7)
            .wrapping_add(hash << 8)
            .wrapping_add(hash << 24);
    }
    hash
}

/// Consistent hash ring with virtual replicas
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// hash point -> target alias
    points: HashMap<u32, String>,
    /// numerically sorted hash points
    sorted: Vec<u32>,
}

impl HashRing {
    /// Create an empty ring
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ring over `targets` in one step
    pub fn with_targets<I, S>(targets: I, replicas: u32, salt: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new();
        ring.add_targets(targets, replicas, salt);
        ring
    }

    /// Insert `replicas` points per target, hashing `target + salt + index`.
    ///
    /// A point that collides with an existing one is overwritten by the later
    /// target. The sorted index is rebuilt before returning.
    pub fn add_targets<I, S>(&mut self, targets: I, replicas: u32, salt: &str)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for target in targets {
            let target = target.as_ref();
            for replica in 0..replicas {
                let point = fnv1a_32(&format!("{}{}{}", target, salt, replica));
                self.points.insert(point, target.to_string());
            }
        }
        self.rebuild_sorted_index();
    }

    /// Re-derive the numerically sorted point index from the point map
    pub fn rebuild_sorted_index(&mut self) {
        self.sorted = self.points.keys().copied().collect();
        self.sorted.sort_unstable();
    }

    /// Number of points on the ring
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Target owning the first point at or after `hash(key)`, wrapping to the
    /// first point when the hash is past the last one
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.lookup_hash(fnv1a_32(key))
    }

    /// Same as [`lookup`](Self::lookup) for a precomputed hash
    pub(crate) fn lookup_hash(&self, hash: u32) -> Option<&str> {
        if self.sorted.is_empty() {
            return None;
        }
        let idx = self.sorted.partition_point(|point| *point < hash);
        let point = self.sorted[idx % self.sorted.len()];
        self.points.get(&point).map(String::as_str)
    }
}

/// Process-wide cache of rings keyed by the tie-set they were built from.
///
/// Ties change rarely compared to request rate, so rings are built once per
/// distinct `(targets, replicas, salt)` and shared as `Arc`.
#[derive(Debug)]
pub struct RingCache {
    rings: Mutex<LruCache<String, Arc<HashRing>>>,
}

impl RingCache {
    /// Create a cache holding at most `capacity` rings
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch the ring for `targets`, building it on a miss.
    ///
    /// `targets` order does not matter.
    pub fn get_or_build(&self, targets: &[&str], replicas: u32, salt: &str) -> Arc<HashRing> {
        let mut sorted: Vec<&str> = targets.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let key = format!("{}|{}|{}", sorted.join(","), replicas, salt);

        let mut rings = self.rings.lock();
        if let Some(ring) = rings.get(&key) {
            return Arc::clone(ring);
        }

        tracing::debug!(targets = %sorted.join(","), replicas, "building hash ring");
        let ring = Arc::new(HashRing::with_targets(sorted, replicas, salt));
        rings.set(key, Arc::clone(&ring));
        ring
    }

    /// Number of cached rings
    pub fn len(&self) -> usize {
        self.rings.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.rings.lock().is_empty()
    }
}

impl Default for RingCache {
    fn default() -> Self {
        Self::new(256)
    }
}
