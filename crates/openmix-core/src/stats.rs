//! Lock-free decision counters

use crate::reason::{ReasonCode, ReasonTag};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// High-performance counter for lock-free metrics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-pipeline outcome counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    decisions: AtomicCounter,
    overrides: AtomicCounter,
    degraded: AtomicCounter,
    sticky_kept: AtomicCounter,
    sticky_switched: AtomicCounter,
    feed_errors: AtomicCounter,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Decisions emitted
    pub decisions: u64,
    /// Decisions made by a static override
    pub overrides: u64,
    /// Decisions emitted with the error TTL
    pub degraded: u64,
    /// Sticky choices kept
    pub sticky_kept: u64,
    /// Sticky choices switched
    pub sticky_switched: u64,
    /// Decisions that saw a feed error
    pub feed_errors: u64,
}

impl PipelineStats {
    /// Count one emitted decision
    pub fn record(&self, reason: &ReasonCode) {
        self.decisions.inc();
        if reason.is_degraded() {
            self.degraded.inc();
        }
        for tag in reason.tags() {
            match tag {
                ReasonTag::AsnOverride | ReasonTag::HostnameOverride | ReasonTag::GeoOverride => {
                    self.overrides.inc();
                }
                ReasonTag::StickyKept => {
                    self.sticky_kept.inc();
                }
                ReasonTag::StickySwitched => {
                    self.sticky_switched.inc();
                }
                ReasonTag::FeedError | ReasonTag::FeedEntryError => {
                    self.feed_errors.inc();
                }
                _ => {}
            }
        }
    }

    /// Read every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            decisions: self.decisions.get(),
            overrides: self.overrides.get(),
            degraded: self.degraded.get(),
            sticky_kept: self.sticky_kept.get(),
            sticky_switched: self.sticky_switched.get(),
            feed_errors: self.feed_errors.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_counter() {
        let counter = AtomicCounter::new(0);
        assert_eq!(counter.inc(), 0);
        assert_eq!(counter.inc(), 1);
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_record() {
        let stats = PipelineStats::default();
        let mut reason = ReasonCode::from(ReasonTag::FeedEntryError);
        reason.push(ReasonTag::BestRtt);
        reason.push(ReasonTag::StickyKept);
        stats.record(&reason);
        stats.record(&ReasonCode::from(ReasonTag::AllBelowAvailability));

        let snap = stats.snapshot();
        assert_eq!(snap.decisions, 2);
        assert_eq!(snap.degraded, 1);
        assert_eq!(snap.sticky_kept, 1);
        assert_eq!(snap.feed_errors, 1);
        assert_eq!(snap.overrides, 0);
    }
}
