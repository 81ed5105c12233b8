//! Scoring adjustments applied before extremum selection
//!
//! Two dynamic families exist, both fed from a usage figure per provider:
//!
//! - **Tier padding**: burst/overage pricing. Once a provider's usage passes a
//!   pricing tier its RTT is padded so cheaper providers win more often.
//! - **Target deviation**: steer each provider toward a monthly usage window,
//!   ramping in as the month progresses.
//!
//! Missing inputs never fail scoring; they yield a neutral adjustment tagged
//! with [`ReasonTag::PaddingDataMissing`].

use crate::pool::Extremum;
use crate::reason::ReasonTag;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A numeric adjustment plus an optional diagnostic tag
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    /// Adjustment value (padding fraction or multiplier, by family)
    pub value: f64,
    /// Diagnostic tag when inputs were missing
    pub tag: Option<ReasonTag>,
}

impl Adjustment {
    /// Adjustment computed from real data
    pub const fn of(value: f64) -> Self {
        Self { value, tag: None }
    }

    /// Neutral adjustment caused by missing data
    pub const fn missing(neutral: f64) -> Self {
        Self {
            value: neutral,
            tag: Some(ReasonTag::PaddingDataMissing),
        }
    }
}

/// One burst pricing tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaddingTier {
    /// Usage level at which the tier starts
    pub threshold: f64,
    /// How steeply padding grows past the threshold
    pub multiplier: f64,
}

/// Tiers sorted by descending threshold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<PaddingTier>", into = "Vec<PaddingTier>")]
pub struct TierTable {
    tiers: Vec<PaddingTier>,
}

impl TierTable {
    /// Build a table; tiers with a non-positive or non-finite threshold are dropped
    pub fn new(mut tiers: Vec<PaddingTier>) -> Self {
        tiers.retain(|t| t.threshold.is_finite() && t.threshold > 0.0 && t.multiplier.is_finite());
        tiers.sort_by(|a, b| Extremum::Max.cmp_best_first(a.threshold, b.threshold));
        Self { tiers }
    }

    /// Tiers, highest threshold first
    pub fn tiers(&self) -> &[PaddingTier] {
        &self.tiers
    }

    /// Highest tier whose threshold `value` reaches
    pub fn matching_tier(&self, value: f64) -> Option<&PaddingTier> {
        self.tiers.iter().find(|t| value >= t.threshold)
    }

    /// Padding fraction for `value`: `(value / threshold - 1) * multiplier` of
    /// the matching tier, or `0` below every tier.
    pub fn padding_pct(&self, value: Option<f64>) -> Adjustment {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            return Adjustment::missing(0.0);
        };
        match self.matching_tier(value) {
            Some(tier) => Adjustment::of((value / tier.threshold - 1.0) * tier.multiplier),
            None => Adjustment::of(0.0),
        }
    }
}

impl From<Vec<PaddingTier>> for TierTable {
    fn from(tiers: Vec<PaddingTier>) -> Self {
        Self::new(tiers)
    }
}

impl From<TierTable> for Vec<PaddingTier> {
    fn from(table: TierTable) -> Self {
        table.tiers
    }
}

/// Monthly usage window a provider should stay within
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageTarget {
    /// Usage expected by the end of the month, lower bound
    pub min_usage: f64,
    /// Usage allowed by the end of the month, upper bound
    pub max_usage: f64,
    /// 0.0 ramps the penalty in with the month, 1.0 applies it fully from day one
    #[serde(default)]
    pub strictness: f64,
}

impl UsageTarget {
    /// Multiplier for the base metric given `usage` so far and the elapsed
    /// fraction of the month.
    ///
    /// Under target yields a multiplier below 1 (favoured on RTT), over target
    /// above 1. Within the window, or at the very start of the month, it is 1.
    pub fn penalty(&self, usage: Option<f64>, elapsed: f64) -> Adjustment {
        let Some(usage) = usage.filter(|v| v.is_finite()) else {
            return Adjustment::missing(1.0);
        };
        let elapsed = elapsed.clamp(0.0, 1.0);
        let strictness = self.strictness.clamp(0.0, 1.0);
        let usage = usage.max(0.0);

        let scaled_min = self.min_usage * elapsed;
        let scaled_max = self.max_usage * elapsed;

        let deviance = if usage < scaled_min && scaled_min > 0.0 {
            usage / scaled_min
        } else if usage > scaled_max && scaled_max > 0.0 {
            usage / scaled_max
        } else {
            1.0
        };

        Adjustment::of(1.0 - (1.0 - deviance) * (elapsed + (1.0 - elapsed) * strictness))
    }
}

/// Fixed per-provider padding from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticPadding {
    /// Percentage added to RTT / removed from throughput
    pub percent: f64,
    /// Milliseconds added to RTT
    pub rtt_ms: f64,
}

/// Smallest usage-target penalty fed into [`apply`].
///
/// A provider with no usage at all reaches a penalty of exactly zero; the
/// floor keeps it the most favoured instead of collapsing its score.
pub const PENALTY_FLOOR: f64 = 1e-3;

/// Combine a base metric with every adjustment.
///
/// Lower-is-better: `base * (1 + pct/100) * (1 + tier) * penalty + ms`.
/// Higher-is-better: `base * (1 - pct/100) / ((1 + tier) * penalty)`.
///
/// `penalty` is raised to [`PENALTY_FLOOR`] first.
pub fn apply(
    base: f64,
    direction: Extremum,
    padding: &StaticPadding,
    tier_pct: f64,
    penalty: f64,
) -> f64 {
    let penalty = penalty.max(PENALTY_FLOOR);
    match direction {
        Extremum::Min => {
            base * (1.0 + padding.percent / 100.0) * (1.0 + tier_pct) * penalty + padding.rtt_ms
        }
        Extremum::Max => {
            let divisor = (1.0 + tier_pct) * penalty;
            let padded = base * (1.0 - padding.percent / 100.0);
            if divisor > 0.0 {
                padded / divisor
            } else {
                padded
            }
        }
    }
}

/// Map `value` from `[min, max]` onto `[0, 1]` with 1 the best end
pub fn normalize(value: f64, min: f64, max: f64, direction: Extremum) -> f64 {
    let span = max - min;
    if !(span > 0.0) {
        return 1.0;
    }
    let ratio = ((value - min) / span).clamp(0.0, 1.0);
    match direction {
        Extremum::Min => 1.0 - ratio,
        Extremum::Max => ratio,
    }
}

/// Fraction of the current calendar month (UTC) elapsed at `now`
pub fn month_elapsed_fraction(now: DateTime<Utc>) -> f64 {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single();
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single();

    match (start, end) {
        (Some(start), Some(end)) => {
            let total = (end - start).num_seconds() as f64;
            let elapsed = (now - start).num_seconds() as f64;
            if total > 0.0 {
                (elapsed / total).clamp(0.0, 1.0)
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn burst_tiers() -> TierTable {
        // Deliberately unsorted input
        TierTable::new(vec![
            PaddingTier { threshold: 20_000.0, multiplier: 1.2 },
            PaddingTier { threshold: 30_000.0, multiplier: 1.5 },
            PaddingTier { threshold: 25_000.0, multiplier: 1.3 },
        ])
    }

    #[test]
    fn test_tiers_sorted_descending() {
        let table = burst_tiers();
        let thresholds: Vec<f64> = table.tiers().iter().map(|t| t.threshold).collect();
        assert_eq!(thresholds, vec![30_000.0, 25_000.0, 20_000.0]);
    }

    #[test]
    fn test_padding_top_tier() {
        let pad = burst_tiers().padding_pct(Some(31_233.41));
        assert!((pad.value - 0.061_670_5).abs() < 1e-6);
        assert!(pad.tag.is_none());
    }

    #[test]
    fn test_padding_middle_tier() {
        let pad = burst_tiers().padding_pct(Some(26_000.0));
        assert!((pad.value - 0.052).abs() < 1e-9);
    }

    #[test]
    fn test_padding_below_all_tiers() {
        let pad = burst_tiers().padding_pct(Some(10_000.0));
        assert_eq!(pad, Adjustment::of(0.0));
    }

    #[test]
    fn test_padding_missing_data() {
        let pad = burst_tiers().padding_pct(None);
        assert_eq!(pad.value, 0.0);
        assert_eq!(pad.tag, Some(ReasonTag::PaddingDataMissing));
    }

    #[test]
    fn test_tier_table_deserializes_from_list() {
        let table: TierTable =
            serde_json::from_str(r#"[{"threshold": 1.0, "multiplier": 2.0}, {"threshold": 5.0, "multiplier": 1.0}]"#)
                .unwrap();
        assert_eq!(table.tiers()[0].threshold, 5.0);
    }

    #[test]
    fn test_penalty_under_target_favours() {
        let target = UsageTarget { min_usage: 1000.0, max_usage: 2000.0, strictness: 0.0 };
        // Half the month gone, only 250 used against a scaled minimum of 500
        let pen = target.penalty(Some(250.0), 0.5);
        // deviance 0.5 -> 1 - 0.5 * 0.5
        assert!((pen.value - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_penalty_over_target_penalizes() {
        let target = UsageTarget { min_usage: 1000.0, max_usage: 2000.0, strictness: 1.0 };
        let pen = target.penalty(Some(1500.0), 0.5);
        // scaled max 1000, deviance 1.5, full strictness
        assert!((pen.value - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_penalty_within_window_is_neutral() {
        let target = UsageTarget { min_usage: 1000.0, max_usage: 2000.0, strictness: 0.5 };
        assert_eq!(target.penalty(Some(700.0), 0.5).value, 1.0);
    }

    #[test]
    fn test_penalty_end_of_month_ignores_strictness() {
        let lax = UsageTarget { min_usage: 1000.0, max_usage: 2000.0, strictness: 0.0 };
        let strict = UsageTarget { strictness: 1.0, ..lax };
        let a = lax.penalty(Some(3000.0), 1.0).value;
        let b = strict.penalty(Some(3000.0), 1.0).value;
        assert!((a - b).abs() < 1e-12);
        assert!((a - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_penalty_missing_usage() {
        let target = UsageTarget { min_usage: 1.0, max_usage: 2.0, strictness: 0.0 };
        let pen = target.penalty(None, 0.3);
        assert_eq!(pen, Adjustment::missing(1.0));
    }

    #[test]
    fn test_apply_directions() {
        let padding = StaticPadding { percent: 10.0, rtt_ms: 5.0 };
        let rtt = apply(100.0, Extremum::Min, &padding, 0.5, 1.0);
        assert!((rtt - 170.0).abs() < 1e-9);

        let kbps = apply(1000.0, Extremum::Max, &padding, 0.5, 1.0);
        assert!((kbps - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_zero_usage_is_most_favoured() {
        let target = UsageTarget { min_usage: 1000.0, max_usage: 2000.0, strictness: 1.0 };
        let none = StaticPadding::default();
        let penalties: Vec<f64> = [0.0, 1.0, 700.0]
            .iter()
            .map(|usage| target.penalty(Some(*usage), 0.5).value)
            .collect();
        assert_eq!(penalties[0], 0.0);
        assert_eq!(penalties[2], 1.0);

        let kbps: Vec<f64> = penalties
            .iter()
            .map(|p| apply(1000.0, Extremum::Max, &none, 0.0, *p))
            .collect();
        assert!(kbps[0] > kbps[1] && kbps[1] > kbps[2]);
        assert!((kbps[0] - 1000.0 / PENALTY_FLOOR).abs() < 1e-6);
        assert!((kbps[2] - 1000.0).abs() < 1e-9);

        let rtt: Vec<f64> = penalties
            .iter()
            .map(|p| apply(100.0, Extremum::Min, &none, 0.0, *p))
            .collect();
        assert!(rtt[0] < rtt[1] && rtt[1] < rtt[2]);
        assert!(rtt[0] > 0.0);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(50.0, 50.0, 150.0, Extremum::Min), 1.0);
        assert_eq!(normalize(150.0, 50.0, 150.0, Extremum::Min), 0.0);
        assert_eq!(normalize(100.0, 50.0, 150.0, Extremum::Max), 0.5);
        assert_eq!(normalize(7.0, 7.0, 7.0, Extremum::Max), 1.0);
    }

    #[test]
    fn test_month_fraction() {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(month_elapsed_fraction(start), 0.0);

        // 2024 is a leap year: February has 29 days
        let mid = Utc.with_ymd_and_hms(2024, 2, 15, 12, 0, 0).unwrap();
        assert!((month_elapsed_fraction(mid) - 0.5).abs() < 1e-9);

        let december = Utc.with_ymd_and_hms(2023, 12, 31, 12, 0, 0).unwrap();
        assert!(month_elapsed_fraction(december) > 0.98);
    }

    proptest! {
        #[test]
        fn prop_padding_monotonic_within_tier(a in 0.0f64..60_000.0, b in 0.0f64..60_000.0) {
            let table = burst_tiers();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let same_tier = table.matching_tier(lo) == table.matching_tier(hi);
            prop_assume!(same_tier);
            prop_assert!(table.padding_pct(Some(lo)).value <= table.padding_pct(Some(hi)).value);
        }

        #[test]
        fn prop_padding_never_negative(v in -1e6f64..1e6) {
            prop_assert!(burst_tiers().padding_pct(Some(v)).value >= 0.0);
        }

        #[test]
        fn prop_penalty_non_negative(usage in 0.0f64..1e6, elapsed in 0.0f64..1.0, strictness in 0.0f64..1.0) {
            let target = UsageTarget { min_usage: 1000.0, max_usage: 5000.0, strictness };
            prop_assert!(target.penalty(Some(usage), elapsed).value >= 0.0);
        }
    }
}
