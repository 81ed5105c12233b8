//! Candidate pool
//!
//! A pool maps provider alias to the metrics gathered for it during one
//! request. Every operation returns a new pool, so a source pool can be reused
//! by later stages (e.g. the highest-availability fallback reads the pool as it
//! was before the availability filter ran).
//!
//! Iteration is alias-ordered. Among exactly equal values the
//! lexicographically smallest alias wins.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Metric fields a candidate can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Availability percentage
    Avail,
    /// HTTP RTT (ms)
    HttpRtt,
    /// HTTP throughput (kbps)
    HttpKbps,
    /// Custom health score from a feed
    Health,
    /// Usage figure merged from the usage feed (burst tiers, usage targets)
    Usage,
    /// Adjusted score produced by scoring
    Score,
}

/// Which end of a metric wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extremum {
    /// Lower is better (RTT)
    Min,
    /// Higher is better (kbps, availability)
    Max,
}

impl Extremum {
    /// True when `candidate` beats `incumbent` strictly
    #[inline]
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Min => candidate < incumbent,
            Self::Max => candidate > incumbent,
        }
    }

    /// True when `value` is no worse than `best` by more than `tolerance` (relative)
    #[inline]
    pub fn within(self, value: f64, best: f64, tolerance: f64) -> bool {
        let slack = best.abs() * tolerance.max(0.0);
        match self {
            Self::Min => value <= best + slack,
            Self::Max => value >= best - slack,
        }
    }

    /// Ordering that sorts best-first
    pub fn cmp_best_first(self, a: f64, b: f64) -> Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Self::Min => ord,
            Self::Max => ord.reverse(),
        }
    }
}

/// Metric values for one candidate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Availability percentage
    pub avail: Option<f64>,
    /// HTTP RTT (ms)
    pub http_rtt: Option<f64>,
    /// HTTP throughput (kbps)
    pub http_kbps: Option<f64>,
    /// Health score
    pub health: Option<f64>,
    /// Usage figure
    pub usage: Option<f64>,
    /// Adjusted score
    pub score: Option<f64>,
}

impl Metrics {
    /// Read a field
    #[inline]
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Avail => self.avail,
            Metric::HttpRtt => self.http_rtt,
            Metric::HttpKbps => self.http_kbps,
            Metric::Health => self.health,
            Metric::Usage => self.usage,
            Metric::Score => self.score,
        }
    }

    /// Write a field
    #[inline]
    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        let slot = match metric {
            Metric::Avail => &mut self.avail,
            Metric::HttpRtt => &mut self.http_rtt,
            Metric::HttpKbps => &mut self.http_kbps,
            Metric::Health => &mut self.health,
            Metric::Usage => &mut self.usage,
            Metric::Score => &mut self.score,
        };
        *slot = value;
    }
}

/// One traffic destination under consideration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Provider alias
    pub alias: String,
    /// CNAME (or address) answered when chosen
    pub cname: String,
    /// Weight for weighted-random selection
    pub weight: f64,
    /// Gathered metrics
    pub metrics: Metrics,
}

impl Candidate {
    /// Candidate without metrics
    pub fn new(alias: impl Into<String>, cname: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            cname: cname.into(),
            weight: 1.0,
            metrics: Metrics::default(),
        }
    }

    /// Builder-style metric setter
    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.metrics.set(metric, Some(value));
        self
    }

    /// Builder-style weight setter
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Read a metric that is present and not NaN
    #[inline]
    pub fn value(&self, metric: Metric) -> Option<f64> {
        self.metrics.get(metric).filter(|v| !v.is_nan())
    }
}

/// Alias-keyed set of candidates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidatePool {
    candidates: BTreeMap<String, Candidate>,
}

impl CandidatePool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a candidate
    pub fn insert(&mut self, candidate: Candidate) {
        self.candidates.insert(candidate.alias.clone(), candidate);
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Look up a candidate
    pub fn get(&self, alias: &str) -> Option<&Candidate> {
        self.candidates.get(alias)
    }

    /// Check membership
    pub fn contains(&self, alias: &str) -> bool {
        self.candidates.contains_key(alias)
    }

    /// Candidates in alias order
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    /// Aliases in order
    pub fn aliases(&self) -> Vec<&str> {
        self.candidates.keys().map(String::as_str).collect()
    }

    /// Keep candidates for which `predicate(candidate, alias)` holds
    pub fn filter<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&Candidate, &str) -> bool,
    {
        self.candidates
            .iter()
            .filter(|(alias, candidate)| predicate(candidate, alias))
            .map(|(_, candidate)| candidate.clone())
            .collect()
    }

    /// Narrowing join: drop aliases absent from `source`, copy the rest into `metric`
    pub fn intersect_by_key(&self, source: &HashMap<String, f64>, metric: Metric) -> Self {
        self.candidates
            .values()
            .filter_map(|candidate| {
                let value = source.get(&candidate.alias).copied()?;
                let mut candidate = candidate.clone();
                candidate.metrics.set(metric, Some(value));
                Some(candidate)
            })
            .collect()
    }

    /// Union join: every alias survives; missing values take `default`
    pub fn merge_by_key(
        &self,
        source: &HashMap<String, f64>,
        metric: Metric,
        default: Option<f64>,
    ) -> Self {
        self.candidates
            .values()
            .map(|candidate| {
                let mut candidate = candidate.clone();
                let value = source.get(&candidate.alias).copied().or(default);
                candidate.metrics.set(metric, value);
                candidate
            })
            .collect()
    }

    /// Rewrite one metric on every candidate
    pub fn map_metric<F>(&self, metric: Metric, mut f: F) -> Self
    where
        F: FnMut(&Candidate) -> Option<f64>,
    {
        self.candidates
            .values()
            .map(|candidate| {
                let value = f(candidate);
                let mut candidate = candidate.clone();
                candidate.metrics.set(metric, value);
                candidate
            })
            .collect()
    }

    /// Candidate with the best `metric` value, skipping `exclude` and
    /// candidates without the metric. `None` for an empty result.
    pub fn select_extremum(
        &self,
        metric: Metric,
        extremum: Extremum,
        exclude: Option<&HashSet<String>>,
    ) -> Option<&Candidate> {
        let mut best: Option<(&Candidate, f64)> = None;

        for candidate in self.candidates.values() {
            if exclude.map_or(false, |set| set.contains(&candidate.alias)) {
                continue;
            }
            let Some(value) = candidate.value(metric) else {
                continue;
            };
            match best {
                Some((_, incumbent)) if !extremum.is_better(value, incumbent) => {}
                _ => best = Some((candidate, value)),
            }
        }

        best.map(|(candidate, _)| candidate)
    }

    /// Every candidate within `tolerance` (relative) of the best `metric` value,
    /// best first
    pub fn ties(&self, metric: Metric, extremum: Extremum, tolerance: f64) -> Vec<&Candidate> {
        let Some(best) = self
            .select_extremum(metric, extremum, None)
            .and_then(|c| c.value(metric))
        else {
            return Vec::new();
        };

        let mut ties: Vec<&Candidate> = self
            .candidates
            .values()
            .filter(|c| {
                c.value(metric)
                    .map_or(false, |v| extremum.within(v, best, tolerance))
            })
            .collect();

        // Stable sort keeps alias order among equals
        ties.sort_by(|a, b| {
            extremum.cmp_best_first(
                a.value(metric).unwrap_or(f64::NAN),
                b.value(metric).unwrap_or(f64::NAN),
            )
        });
        ties
    }
}

impl FromIterator<Candidate> for CandidatePool {
    fn from_iter<I: IntoIterator<Item = Candidate>>(iter: I) -> Self {
        let mut pool = Self::new();
        for candidate in iter {
            pool.insert(candidate);
        }
        pool
    }
}
