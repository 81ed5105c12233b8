//! Per-request decision pipeline
//!
//! Stages run in priority order and the first one that settles the answer
//! short-circuits the rest:
//!
//! 1. static overrides (ASN, hostname prefix, state, country, market)
//! 2. data sufficiency, falling back to a degraded strategy
//! 3. availability filter
//! 4. health feed filter
//! 5. scoring, extremum selection and tie-break
//! 6. sticky override
//!
//! Every path ends in a [`DecisionResult`]; nothing here returns an error to
//! the host.

use crate::config::{AppConfig, DegradedStrategy, ProviderConfig, SelectionMode, TieBreak};
use crate::error::OpenmixResult;
use crate::feed::parse_feed;
use crate::hash_ring::RingCache;
use crate::host::{DataSource, ProbeKind, ProbeTable, ProviderRegistry, RequestContext, ResponseSink};
use crate::pool::{Candidate, CandidatePool, Extremum, Metric};
use crate::reason::{ReasonCode, ReasonTag};
use crate::scoring::{self, month_elapsed_fraction};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::sticky::{StickyOutcome, StickyStore};
use chrono::{DateTime, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;

/// Final answer for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionResult {
    /// Chosen alias
    pub provider: String,
    /// CNAME (or address) of the chosen alias
    pub cname: String,
    /// TTL in seconds
    pub ttl: u32,
    /// Why it was chosen
    #[serde(serialize_with = "serialize_reason")]
    pub reason: ReasonCode,
}

fn serialize_reason<S: serde::Serializer>(reason: &ReasonCode, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(reason)
}

/// The filter-score-select engine for one app configuration
#[derive(Debug)]
pub struct DecisionPipeline {
    config: Arc<AppConfig>,
    sticky: Option<Arc<StickyStore>>,
    rings: Arc<RingCache>,
    stats: PipelineStats,
}

impl DecisionPipeline {
    /// Validate `config` and create process-wide state for it
    pub fn new(config: AppConfig) -> OpenmixResult<Self> {
        let sticky = config
            .sticky
            .as_ref()
            .map(|s| Arc::new(StickyStore::new(s.capacity, s.shards)));
        Self::with_shared_state(config, sticky, Arc::new(RingCache::default()))
    }

    /// Validate `config` and use caller-owned sticky store and ring cache
    pub fn with_shared_state(
        config: AppConfig,
        sticky: Option<Arc<StickyStore>>,
        rings: Arc<RingCache>,
    ) -> OpenmixResult<Self> {
        config.validate()?;
        tracing::info!(
            providers = config.providers.len(),
            selection = ?config.selection,
            "openmix pipeline configured"
        );
        Ok(Self {
            config: Arc::new(config),
            sticky,
            rings,
            stats: PipelineStats::default(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Sticky store, when stickiness is configured
    pub fn sticky_store(&self) -> Option<&Arc<StickyStore>> {
        self.sticky.as_ref()
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register every provider with the host
    pub fn init<R: ProviderRegistry + ?Sized>(&self, registry: &mut R) {
        for provider in &self.config.providers {
            registry.require_provider(&provider.alias);
        }
    }

    /// Decide for the current request and commit the answer to `host`
    pub fn handle<H>(&self, host: &mut H, ctx: &RequestContext) -> DecisionResult
    where
        H: DataSource + ResponseSink + ?Sized,
    {
        let result = self.decide(&*host, ctx, Utc::now(), &mut rand::thread_rng());
        self.emit(&result, host);
        result
    }

    /// Make the three sink calls for `result`
    pub fn emit<S: ResponseSink + ?Sized>(&self, result: &DecisionResult, sink: &mut S) {
        sink.respond(&result.provider, &result.cname);
        sink.set_ttl(result.ttl);
        sink.set_reason_code(&result.reason.to_string());
    }

    /// Run the pipeline without committing anything
    pub fn decide<D, R>(
        &self,
        data: &D,
        ctx: &RequestContext,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> DecisionResult
    where
        D: DataSource + ?Sized,
        R: Rng,
    {
        let result = self.run(data, ctx, now, rng);
        self.stats.record(&result.reason);
        if result.reason.is_degraded() {
            tracing::warn!(
                provider = %result.provider,
                reason = %result.reason,
                ttl = result.ttl,
                "degraded openmix decision"
            );
        } else {
            tracing::debug!(
                provider = %result.provider,
                reason = %result.reason,
                ttl = result.ttl,
                "openmix decision"
            );
        }
        result
    }

    fn run<D, R>(
        &self,
        data: &D,
        ctx: &RequestContext,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> DecisionResult
    where
        D: DataSource + ?Sized,
        R: Rng,
    {
        let cfg = &*self.config;

        if let Some(result) = self.check_overrides(ctx) {
            return result;
        }

        let base: CandidatePool = cfg.providers.iter().map(candidate_for).collect();
        let avail = data.probe(ProbeKind::Avail);
        let required: Vec<(ProbeKind, ProbeTable)> = cfg
            .selection
            .required_probes()
            .iter()
            .map(|kind| (*kind, data.probe(*kind)))
            .collect();

        let sparse = !covers_all(&base, &avail)
            || required.iter().any(|(_, table)| !covers_all(&base, table));
        if sparse && cfg.require_complete_data {
            return self.degraded(&base, &avail, ctx, rng, ReasonCode::from(ReasonTag::DataMissing));
        }

        let mut pool = base.intersect_by_key(&avail, Metric::Avail);
        for (kind, table) in &required {
            pool = pool.intersect_by_key(table, metric_for(*kind));
        }
        if pool.is_empty() {
            return self.degraded(&base, &avail, ctx, rng, ReasonCode::from(ReasonTag::DataMissing));
        }
        if cfg.tie_break == TieBreak::Kbps
            && !cfg.selection.required_probes().contains(&ProbeKind::HttpKbps)
        {
            pool = pool.merge_by_key(&data.probe(ProbeKind::HttpKbps), Metric::HttpKbps, None);
        }

        // Availability
        let threshold = cfg.availability_threshold_for(ctx.country.as_deref());
        let available = pool.filter(|c, _| c.value(Metric::Avail).map_or(false, |a| a >= threshold));
        if available.is_empty() {
            let measured = base.intersect_by_key(&avail, Metric::Avail);
            return self.highest_availability(&measured, ReasonCode::from(ReasonTag::AllBelowAvailability));
        }

        let mut reason = ReasonCode::new();

        // Health
        let healthy = match &cfg.health {
            None => available,
            Some(health) => {
                let parsed = parse_feed(&data.feed(&health.feed.name), &health.feed);
                if parsed.is_absent() {
                    reason.push(ReasonTag::FeedError);
                    available
                } else {
                    if !parsed.failed.is_empty() {
                        reason.push(ReasonTag::FeedEntryError);
                    }
                    let scored = available.intersect_by_key(&parsed.values, Metric::Health);
                    let healthy = scored.filter(|c, _| {
                        c.value(Metric::Health).map_or(false, |h| h >= health.threshold)
                    });
                    if healthy.is_empty() {
                        reason.push(ReasonTag::AllUnhealthy);
                        return self.highest_availability(&available, reason);
                    }
                    healthy
                }
            }
        };

        // Scoring
        let metered = match &cfg.usage {
            None => healthy.clone(),
            Some(spec) => {
                let parsed = parse_feed(&data.feed(&spec.name), spec);
                if parsed.batch_failed {
                    reason.push(ReasonTag::FeedError);
                } else if !parsed.failed.is_empty() {
                    reason.push(ReasonTag::FeedEntryError);
                }
                healthy.merge_by_key(&parsed.values, Metric::Usage, None)
            }
        };
        let direction = cfg.selection.direction();
        let scored = self.score(&metered, now, &mut reason);

        let winner = match &cfg.selection {
            SelectionMode::WeightedRandom => {
                reason.push(ReasonTag::WeightedRandom);
                weighted_pick(&scored, rng)
            }
            mode => {
                reason.push(match mode {
                    SelectionMode::BestRtt => ReasonTag::BestRtt,
                    SelectionMode::BestKbps => ReasonTag::BestKbps,
                    _ => ReasonTag::BestScore,
                });
                self.select_with_ties(&scored, direction, ctx, &mut reason)
            }
        };

        let Some(mut winner) = winner else {
            reason.push(ReasonTag::DataMissing);
            return self.highest_availability(&healthy, reason);
        };

        // Sticky
        if let (Some(sticky), Some(store)) = (&cfg.sticky, &self.sticky) {
            if let Some(key) = sticky.key.derive(ctx) {
                let outcome = store.decide(
                    &key,
                    &scored,
                    &winner,
                    Metric::Score,
                    direction,
                    sticky.variance_threshold,
                );
                reason.push(match &outcome {
                    StickyOutcome::Kept(_) => ReasonTag::StickyKept,
                    StickyOutcome::Switched { .. } => ReasonTag::StickySwitched,
                });
                winner = outcome.alias().to_string();
            }
        }

        self.result(&winner, reason)
    }

    fn check_overrides(&self, ctx: &RequestContext) -> Option<DecisionResult> {
        let overrides = &self.config.overrides;

        let matched = ctx
            .asn
            .and_then(|asn| overrides.asn.get(&asn))
            .map(|alias| (alias, ReasonTag::AsnOverride))
            .or_else(|| {
                ctx.hostname_prefix
                    .as_ref()
                    .and_then(|p| overrides.hostname_prefix.get(p))
                    .map(|alias| (alias, ReasonTag::HostnameOverride))
            })
            .or_else(|| {
                [
                    (&ctx.state, &overrides.state),
                    (&ctx.country, &overrides.country),
                    (&ctx.market, &overrides.market),
                ]
                .into_iter()
                .find_map(|(value, map)| value.as_ref().and_then(|v| map.get(v)))
                .map(|alias| (alias, ReasonTag::GeoOverride))
            });

        let (alias, tag) = matched?;
        if self.config.provider(alias).is_none() {
            tracing::warn!(alias = %alias, "override points at unknown provider");
            return None;
        }
        Some(self.result(alias, ReasonCode::from(tag)))
    }

    /// Adjusted score per candidate in `Metric::Score`
    fn score(
        &self,
        pool: &CandidatePool,
        now: DateTime<Utc>,
        reason: &mut ReasonCode,
    ) -> CandidatePool {
        let cfg = &*self.config;
        let elapsed = month_elapsed_fraction(now);

        let mut adjusted = |c: &Candidate, metric: Metric, direction: Extremum| -> Option<f64> {
            let base = c.value(metric)?;
            let provider = cfg.provider(&c.alias)?;
            let usage_value = c.value(Metric::Usage);

            let tier = if provider.burst_tiers.tiers().is_empty() {
                0.0
            } else {
                let adj = provider.burst_tiers.padding_pct(usage_value);
                if let Some(tag) = adj.tag {
                    reason.push(tag);
                }
                adj.value
            };
            let penalty = match &provider.usage_target {
                None => 1.0,
                Some(target) => {
                    let adj = target.penalty(usage_value, elapsed);
                    if let Some(tag) = adj.tag {
                        reason.push(tag);
                    }
                    adj.value
                }
            };
            Some(scoring::apply(base, direction, &provider.padding, tier, penalty))
        };

        match &cfg.selection {
            SelectionMode::BestRtt => {
                pool.map_metric(Metric::Score, |c| adjusted(c, Metric::HttpRtt, Extremum::Min))
            }
            SelectionMode::BestKbps => {
                pool.map_metric(Metric::Score, |c| adjusted(c, Metric::HttpKbps, Extremum::Max))
            }
            SelectionMode::WeightedRandom => pool.map_metric(Metric::Score, |_| Some(1.0)),
            SelectionMode::Composite { rtt_weight, kbps_weight } => {
                let rtt = pool.map_metric(Metric::HttpRtt, |c| adjusted(c, Metric::HttpRtt, Extremum::Min));
                let both = rtt.map_metric(Metric::HttpKbps, |c| {
                    adjusted(c, Metric::HttpKbps, Extremum::Max)
                });
                let (rtt_min, rtt_max) = bounds(&both, Metric::HttpRtt);
                let (kbps_min, kbps_max) = bounds(&both, Metric::HttpKbps);
                let total = rtt_weight + kbps_weight;

                both.map_metric(Metric::Score, |c| {
                    let r = scoring::normalize(c.value(Metric::HttpRtt)?, rtt_min, rtt_max, Extremum::Min);
                    let k = scoring::normalize(c.value(Metric::HttpKbps)?, kbps_min, kbps_max, Extremum::Max);
                    Some((rtt_weight * r + kbps_weight * k) / total)
                })
            }
        }
    }

    fn select_with_ties(
        &self,
        scored: &CandidatePool,
        direction: Extremum,
        ctx: &RequestContext,
        reason: &mut ReasonCode,
    ) -> Option<String> {
        let best = scored.select_extremum(Metric::Score, direction, None)?;
        let mut winner = best.alias.clone();

        let ties = scored.ties(Metric::Score, direction, self.config.tie_tolerance);
        if ties.len() < 2 {
            return Some(winner);
        }

        match &self.config.tie_break {
            TieBreak::None => {}
            TieBreak::Kbps => {
                let tied: CandidatePool = ties.into_iter().cloned().collect();
                if let Some(fastest) = tied.select_extremum(Metric::HttpKbps, Extremum::Max, None) {
                    winner = fastest.alias.clone();
                    reason.push(ReasonTag::KbpsTieBreak);
                }
            }
            TieBreak::HashRing { replicas, salt } => {
                if let Some(asn) = ctx.asn {
                    let targets: Vec<&str> = ties.iter().map(|c| c.alias.as_str()).collect();
                    let ring = self.rings.get_or_build(&targets, *replicas, salt);
                    if let Some(target) = ring.lookup(&asn.to_string()) {
                        winner = target.to_string();
                        reason.push(ReasonTag::HashRingTieBreak);
                    }
                }
            }
        }
        Some(winner)
    }

    fn degraded<R: Rng>(
        &self,
        base: &CandidatePool,
        avail: &ProbeTable,
        ctx: &RequestContext,
        rng: &mut R,
        mut reason: ReasonCode,
    ) -> DecisionResult {
        let cfg = &*self.config;

        if cfg.degraded == DegradedStrategy::Sticky {
            let previous = match (&cfg.sticky, &self.sticky) {
                (Some(sticky), Some(store)) => sticky.key.derive(ctx).and_then(|key| store.get(&key)),
                _ => None,
            };
            if let Some(prev) = previous.filter(|p| base.contains(p)) {
                reason.push(ReasonTag::PreviousSticky);
                return self.result(&prev, reason);
            }
        }

        if matches!(cfg.degraded, DegradedStrategy::Sticky | DegradedStrategy::HighestAvailability) {
            let with_avail = base.intersect_by_key(avail, Metric::Avail);
            if let Some(best) = with_avail.select_extremum(Metric::Avail, Extremum::Max, None) {
                reason.push(ReasonTag::HighestAvailability);
                return self.result(&best.alias, reason);
            }
        }

        if cfg.degraded != DegradedStrategy::Default {
            let aliases = base.aliases();
            if let Some(alias) = aliases.choose(rng) {
                reason.push(ReasonTag::RandomProvider);
                return self.result(alias, reason);
            }
        }

        reason.push(ReasonTag::DefaultProvider);
        self.result(&cfg.default_provider, reason)
    }

    fn highest_availability(&self, pool: &CandidatePool, mut reason: ReasonCode) -> DecisionResult {
        match pool.select_extremum(Metric::Avail, Extremum::Max, None) {
            Some(best) => {
                reason.push(ReasonTag::HighestAvailability);
                self.result(&best.alias, reason)
            }
            None => {
                reason.push(ReasonTag::DefaultProvider);
                self.result(&self.config.default_provider, reason)
            }
        }
    }

    fn result(&self, alias: &str, reason: ReasonCode) -> DecisionResult {
        let cfg = &*self.config;
        let provider = cfg
            .provider(alias)
            .or_else(|| cfg.provider(&cfg.default_provider));
        let (provider, cname) = match provider {
            Some(p) => (p.alias.clone(), p.cname.clone()),
            // Unreachable after validation; answer with the alias verbatim
            None => (alias.to_string(), alias.to_string()),
        };
        let ttl = if reason.is_degraded() { cfg.error_ttl } else { cfg.default_ttl };
        DecisionResult {
            provider,
            cname,
            ttl,
            reason,
        }
    }
}

fn candidate_for(provider: &ProviderConfig) -> Candidate {
    Candidate::new(provider.alias.clone(), provider.cname.clone()).with_weight(provider.weight)
}

fn metric_for(kind: ProbeKind) -> Metric {
    match kind {
        ProbeKind::Avail => Metric::Avail,
        ProbeKind::HttpRtt => Metric::HttpRtt,
        ProbeKind::HttpKbps => Metric::HttpKbps,
    }
}

fn covers_all(pool: &CandidatePool, table: &ProbeTable) -> bool {
    pool.iter()
        .all(|c| table.get(&c.alias).map_or(false, |v| v.is_finite()))
}

fn bounds(pool: &CandidatePool, metric: Metric) -> (f64, f64) {
    pool.iter()
        .filter_map(|c| c.value(metric))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

fn weighted_pick<R: Rng>(pool: &CandidatePool, rng: &mut R) -> Option<String> {
    let candidates: Vec<&Candidate> = pool.iter().collect();
    if candidates.is_empty() {
        return None;
    }
    let weights: Vec<f64> = candidates.iter().map(|c| c.weight.max(0.0)).collect();
    match WeightedIndex::new(&weights) {
        Ok(dist) => Some(candidates[dist.sample(rng)].alias.clone()),
        // All weights zero: fall back to uniform
        Err(_) => candidates.choose(rng).map(|c| c.alias.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConfig, ProviderConfig, StickyConfig, StickyKey};
    use crate::feed::FeedSpec;
    use crate::host::MemoryHost;
    use crate::scoring::{PaddingTier, StaticPadding, TierTable, UsageTarget};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn providers(aliases: &[&str]) -> Vec<ProviderConfig> {
        aliases
            .iter()
            .map(|a| ProviderConfig::new(*a, format!("{}.cdn.net", a)))
            .collect()
    }

    fn rtt_config() -> AppConfig {
        AppConfig::new(providers(&["a", "b", "c"]), "a", SelectionMode::BestRtt)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 16, 0, 0, 0).unwrap()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn decide(pipeline: &DecisionPipeline, host: &MemoryHost) -> DecisionResult {
        pipeline.decide(host, &host.context, now(), &mut rng())
    }

    fn healthy_host() -> MemoryHost {
        MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("a", 100.0), ("b", 99.0), ("c", 100.0)])
            .with_probe(ProbeKind::HttpRtt, [("a", 200.0), ("b", 90.0), ("c", 300.0)])
            .with_probe(ProbeKind::HttpKbps, [("a", 5000.0), ("b", 4000.0), ("c", 9000.0)])
    }

    #[test]
    fn test_best_rtt() {
        let pipeline = DecisionPipeline::new(rtt_config()).unwrap();
        let result = decide(&pipeline, &healthy_host());
        assert_eq!(result.provider, "b");
        assert_eq!(result.cname, "b.cdn.net");
        assert_eq!(result.ttl, 20);
        assert_eq!(result.reason.to_string(), "BR");
    }

    #[test]
    fn test_best_kbps() {
        let config = AppConfig::new(providers(&["a", "b", "c"]), "a", SelectionMode::BestKbps);
        let pipeline = DecisionPipeline::new(config).unwrap();
        let result = decide(&pipeline, &healthy_host());
        assert_eq!(result.provider, "c");
        assert_eq!(result.reason.to_string(), "BK");
    }

    #[test]
    fn test_all_below_availability_falls_back_to_highest() {
        let config = AppConfig::new(providers(&["a", "b"]), "b", SelectionMode::BestRtt);
        let pipeline = DecisionPipeline::new(config).unwrap();
        let host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("a", 83.0), ("b", 80.0)])
            .with_probe(ProbeKind::HttpRtt, [("a", 300.0), ("b", 50.0)]);

        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "a");
        assert_eq!(result.ttl, 10);
        assert!(result.reason.contains(ReasonTag::AllBelowAvailability));
        assert!(result.reason.is_degraded());
    }

    #[test]
    fn test_all_below_availability_considers_providers_without_metric() {
        let mut config = rtt_config();
        config.require_complete_data = false;
        let pipeline = DecisionPipeline::new(config).unwrap();
        // a has the best availability but no RTT sample
        let host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("a", 85.0), ("b", 70.0), ("c", 60.0)])
            .with_probe(ProbeKind::HttpRtt, [("b", 90.0), ("c", 80.0)]);

        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "a");
        assert_eq!(result.reason.to_string(), "AB,HA");
        assert_eq!(result.ttl, 10);
    }

    #[test]
    fn test_country_threshold() {
        let mut config = rtt_config();
        config.country_availability.insert("IN".into(), 99.5);
        let pipeline = DecisionPipeline::new(config).unwrap();
        let mut host = healthy_host();
        host.context.country = Some("IN".into());

        // b (99%) is below the Indian threshold, a is next best RTT
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "a");
    }

    #[test]
    fn test_override_precedence() {
        let mut config = rtt_config();
        config.overrides.asn.insert(7922, "c".into());
        config.overrides.country.insert("US".into(), "a".into());
        config.overrides.market.insert("NA".into(), "b".into());
        let pipeline = DecisionPipeline::new(config).unwrap();

        let mut host = healthy_host();
        host.context.asn = Some(7922);
        host.context.country = Some("US".into());
        host.context.market = Some("NA".into());
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "c");
        assert_eq!(result.reason.to_string(), "AO");

        host.context.asn = Some(1);
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "a");
        assert_eq!(result.reason.to_string(), "GO");

        host.context.country = Some("CA".into());
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "b");
    }

    #[test]
    fn test_override_ignores_probe_data() {
        let mut config = rtt_config();
        config.overrides.hostname_prefix.insert("img".into(), "c".into());
        let pipeline = DecisionPipeline::new(config).unwrap();
        let mut host = MemoryHost::default();
        host.context.hostname_prefix = Some("img".into());

        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "c");
        assert_eq!(result.reason.to_string(), "HO");
        assert_eq!(result.ttl, 20);
    }

    #[test]
    fn test_sparse_data_degrades_to_highest_availability() {
        let pipeline = DecisionPipeline::new(rtt_config()).unwrap();
        let host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("a", 97.0), ("b", 99.0)])
            .with_probe(ProbeKind::HttpRtt, [("a", 10.0), ("b", 20.0), ("c", 30.0)]);

        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "b");
        assert_eq!(result.ttl, 10);
        assert_eq!(result.reason.to_string(), "DM,HA");
    }

    #[test]
    fn test_no_data_random_then_default() {
        let mut config = rtt_config();
        config.degraded = DegradedStrategy::Random;
        let pipeline = DecisionPipeline::new(config).unwrap();
        let result = decide(&pipeline, &MemoryHost::default());
        assert!(["a", "b", "c"].contains(&result.provider.as_str()));
        assert_eq!(result.reason.to_string(), "DM,RP");

        // HighestAvailability with no availability data falls through to random
        let pipeline = DecisionPipeline::new(rtt_config()).unwrap();
        let result = decide(&pipeline, &MemoryHost::default());
        assert_eq!(result.reason.to_string(), "DM,RP");

        let mut config = rtt_config();
        config.default_provider = "c".into();
        config.degraded = DegradedStrategy::Default;
        let pipeline = DecisionPipeline::new(config).unwrap();
        let result = decide(&pipeline, &MemoryHost::default());
        assert_eq!(result.provider, "c");
        assert_eq!(result.reason.to_string(), "DM,DP");
    }

    #[test]
    fn test_partial_data_with_intersect_semantics() {
        let mut config = rtt_config();
        config.require_complete_data = false;
        let pipeline = DecisionPipeline::new(config).unwrap();
        let host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("a", 100.0), ("c", 100.0)])
            .with_probe(ProbeKind::HttpRtt, [("a", 200.0), ("b", 90.0), ("c", 150.0)]);

        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "c");
        assert_eq!(result.ttl, 20);
    }

    #[test]
    fn test_degraded_sticky_uses_previous() {
        let mut config = rtt_config();
        config.sticky = Some(StickyConfig {
            capacity: 100,
            shards: 1,
            variance_threshold: 0.1,
            key: StickyKey::Asn,
        });
        config.degraded = DegradedStrategy::Sticky;
        let pipeline = DecisionPipeline::new(config).unwrap();

        let mut host = healthy_host();
        host.context.asn = Some(42);
        assert_eq!(decide(&pipeline, &host).provider, "b");

        let mut sparse = MemoryHost::default().with_probe(ProbeKind::Avail, [("a", 100.0)]);
        sparse.context.asn = Some(42);
        let result = decide(&pipeline, &sparse);
        assert_eq!(result.provider, "b");
        assert_eq!(result.reason.to_string(), "DM,PS");
    }

    fn health_config() -> AppConfig {
        let mut config = rtt_config();
        config.health = Some(HealthConfig {
            feed: FeedSpec::new("fusion", "health"),
            threshold: 3.0,
        });
        config
    }

    #[test]
    fn test_health_filter() {
        let pipeline = DecisionPipeline::new(health_config()).unwrap();
        let host = healthy_host().with_feed(
            "fusion",
            [("a", r#"{"health": 5}"#), ("b", r#"{"health": 1}"#), ("c", r#"{"health": 4}"#)],
        );
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "a");
        assert_eq!(result.reason.to_string(), "BR");
    }

    #[test]
    fn test_health_per_key_error_excludes_provider() {
        let pipeline = DecisionPipeline::new(health_config()).unwrap();
        let host = healthy_host().with_feed(
            "fusion",
            [("a", r#"{"health": 5}"#), ("b", "garbage"), ("c", r#"{"health": 4}"#)],
        );
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "a");
        assert_eq!(result.reason.to_string(), "FK,BR");
        assert_eq!(result.ttl, 20);
    }

    #[test]
    fn test_health_batch_failure_skips_filter() {
        let mut config = health_config();
        if let Some(health) = config.health.as_mut() {
            health.feed = FeedSpec::new("fusion", "health").batch();
        }
        let pipeline = DecisionPipeline::new(config).unwrap();
        let host = healthy_host().with_feed(
            "fusion",
            [("a", r#"{"health": 5}"#), ("b", "{"), ("c", r#"{"health": 4}"#)],
        );
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "b");
        assert_eq!(result.reason.to_string(), "FE,BR");
        assert_eq!(result.ttl, 10);
    }

    #[test]
    fn test_all_unhealthy() {
        let pipeline = DecisionPipeline::new(health_config()).unwrap();
        let host = healthy_host().with_feed(
            "fusion",
            [("a", r#"{"health": 0}"#), ("b", r#"{"health": 1}"#), ("c", r#"{"health": 2}"#)],
        );
        let result = decide(&pipeline, &host);
        // a and c tie at 100% availability; smallest alias wins
        assert_eq!(result.provider, "a");
        assert_eq!(result.reason.to_string(), "AU,HA");
        assert_eq!(result.ttl, 10);
    }

    #[test]
    fn test_static_padding_changes_winner() {
        let mut config = rtt_config();
        config.providers[1].padding = StaticPadding { percent: 0.0, rtt_ms: 150.0 };
        let pipeline = DecisionPipeline::new(config).unwrap();
        let result = decide(&pipeline, &healthy_host());
        assert_eq!(result.provider, "a");
    }

    #[test]
    fn test_burst_padding() {
        let mut config = AppConfig::new(providers(&["cheap", "pricey"]), "cheap", SelectionMode::BestRtt);
        config.providers[0].burst_tiers = TierTable::new(vec![
            PaddingTier { threshold: 30_000.0, multiplier: 1.5 },
            PaddingTier { threshold: 20_000.0, multiplier: 1.2 },
        ]);
        config.usage = Some(FeedSpec::new("usage", "mbps"));
        let pipeline = DecisionPipeline::new(config).unwrap();

        let host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("cheap", 100.0), ("pricey", 100.0)])
            .with_probe(ProbeKind::HttpRtt, [("cheap", 100.0), ("pricey", 110.0)]);

        // Under the first tier: cheap wins on raw RTT
        let under = host.clone().with_feed("usage", [("cheap", r#"{"mbps": 15000}"#)]);
        assert_eq!(decide(&pipeline, &under).provider, "cheap");

        // 45000 -> (45000/30000 - 1) * 1.5 = 0.75 padding -> 175ms
        let over = host.clone().with_feed("usage", [("cheap", r#"{"mbps": 45000}"#)]);
        let result = decide(&pipeline, &over);
        assert_eq!(result.provider, "pricey");
        assert_eq!(result.reason.to_string(), "BR");

        // Missing usage: no padding, tagged
        let missing = decide(&pipeline, &host);
        assert_eq!(missing.provider, "cheap");
        assert_eq!(missing.reason.to_string(), "PM,BR");
        assert_eq!(missing.ttl, 20);
    }

    #[test]
    fn test_usage_target_penalty() {
        let mut config = AppConfig::new(providers(&["a", "b"]), "a", SelectionMode::BestRtt);
        let target = UsageTarget { min_usage: 1000.0, max_usage: 2000.0, strictness: 1.0 };
        config.providers[0].usage_target = Some(target);
        config.providers[1].usage_target = Some(target);
        config.usage = Some(FeedSpec::new("usage", "gb"));
        let pipeline = DecisionPipeline::new(config).unwrap();

        // a is faster but far over its pro-rated max; b is under its min
        let host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("a", 100.0), ("b", 100.0)])
            .with_probe(ProbeKind::HttpRtt, [("a", 80.0), ("b", 100.0)])
            .with_feed("usage", [("a", r#"{"gb": 2000}"#), ("b", r#"{"gb": 100}"#)]);
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "b");
    }

    #[test]
    fn test_usage_target_kbps_favours_idle_provider() {
        let target = UsageTarget { min_usage: 1000.0, max_usage: 2000.0, strictness: 1.0 };
        let mut config = AppConfig::new(
            providers(&["idle", "light", "steady"]),
            "steady",
            SelectionMode::BestKbps,
        );
        for provider in config.providers.iter_mut() {
            provider.usage_target = Some(target);
        }
        config.usage = Some(FeedSpec::new("usage", "gb"));
        let pipeline = DecisionPipeline::new(config).unwrap();

        let host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("idle", 100.0), ("light", 100.0), ("steady", 100.0)])
            .with_probe(ProbeKind::HttpKbps, [("idle", 1000.0), ("light", 1000.0), ("steady", 1500.0)]);

        // Half way through the month: idle is at 0, light at 1, steady in its window
        let usage = host.clone().with_feed(
            "usage",
            [("idle", r#"{"gb": 0}"#), ("light", r#"{"gb": 1}"#), ("steady", r#"{"gb": 700}"#)],
        );
        let result = decide(&pipeline, &usage);
        assert_eq!(result.provider, "idle");
        assert_eq!(result.reason.to_string(), "BK");

        let usage = host.clone().with_feed(
            "usage",
            [("idle", r#"{"gb": 700}"#), ("light", r#"{"gb": 1}"#), ("steady", r#"{"gb": 700}"#)],
        );
        assert_eq!(decide(&pipeline, &usage).provider, "light");

        let usage = host.with_feed(
            "usage",
            [("idle", r#"{"gb": 700}"#), ("light", r#"{"gb": 700}"#), ("steady", r#"{"gb": 700}"#)],
        );
        assert_eq!(decide(&pipeline, &usage).provider, "steady");
    }

    #[test]
    fn test_kbps_tie_break() {
        let mut config = rtt_config();
        config.tie_tolerance = 0.1;
        config.tie_break = TieBreak::Kbps;
        let pipeline = DecisionPipeline::new(config).unwrap();
        let host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("a", 100.0), ("b", 100.0), ("c", 100.0)])
            .with_probe(ProbeKind::HttpRtt, [("a", 100.0), ("b", 95.0), ("c", 300.0)])
            .with_probe(ProbeKind::HttpKbps, [("a", 9000.0), ("b", 3000.0), ("c", 20000.0)]);

        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "a");
        assert_eq!(result.reason.to_string(), "BR,KT");
    }

    fn ring_config() -> AppConfig {
        let mut config = AppConfig::new(
            providers(&["foo", "bar", "slow"]),
            "foo",
            SelectionMode::BestRtt,
        );
        config.tie_tolerance = 0.05;
        config.tie_break = TieBreak::HashRing { replicas: 20, salt: "0".into() };
        config
    }

    fn ring_host(asn: u32) -> MemoryHost {
        let mut host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("foo", 100.0), ("bar", 100.0), ("slow", 100.0)])
            .with_probe(ProbeKind::HttpRtt, [("foo", 100.0), ("bar", 102.0), ("slow", 400.0)]);
        host.context.asn = Some(asn);
        host
    }

    #[test]
    fn test_hash_ring_tie_break_is_stable_per_asn() {
        let pipeline = DecisionPipeline::new(ring_config()).unwrap();

        let first = decide(&pipeline, &ring_host(1234));
        assert!(["foo", "bar"].contains(&first.provider.as_str()));
        assert_eq!(first.reason.to_string(), "BR,HR");
        for _ in 0..20 {
            assert_eq!(decide(&pipeline, &ring_host(1234)).provider, first.provider);
        }

        let expected = crate::hash_ring::HashRing::with_targets(["bar", "foo"], 20, "0")
            .lookup("1234")
            .map(str::to_string);
        assert_eq!(Some(first.provider), expected);
    }

    #[test]
    fn test_hash_ring_spreads_asns() {
        let pipeline = DecisionPipeline::new(ring_config()).unwrap();
        let picks: std::collections::HashSet<String> = (0..200)
            .map(|asn| decide(&pipeline, &ring_host(asn)).provider)
            .collect();
        assert!(picks.contains("foo") && picks.contains("bar"));
        assert!(!picks.contains("slow"));
    }

    #[test]
    fn test_hash_ring_without_asn_uses_best() {
        let pipeline = DecisionPipeline::new(ring_config()).unwrap();
        let mut host = ring_host(0);
        host.context.asn = None;
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "foo");
        assert_eq!(result.reason.to_string(), "BR");
    }

    fn sticky_kbps_config(variance: f64) -> AppConfig {
        let mut config = AppConfig::new(providers(&["a", "b"]), "a", SelectionMode::BestKbps);
        config.sticky = Some(StickyConfig {
            capacity: 100,
            shards: 4,
            variance_threshold: variance,
            key: StickyKey::CountryAsn,
        });
        config
    }

    fn kbps_host(a: f64, b: f64) -> MemoryHost {
        let mut host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("a", 100.0), ("b", 100.0)])
            .with_probe(ProbeKind::HttpKbps, [("a", a), ("b", b)]);
        host.context.country = Some("US".into());
        host.context.asn = Some(7922);
        host
    }

    #[test]
    fn test_sticky_kbps() {
        let pipeline = DecisionPipeline::new(sticky_kbps_config(0.2)).unwrap();

        let first = decide(&pipeline, &kbps_host(5000.0, 4000.0));
        assert_eq!(first.provider, "a");
        assert_eq!(first.reason.to_string(), "BK,SW");

        // b pulls slightly ahead: within 20%, stay on a
        let second = decide(&pipeline, &kbps_host(5000.0, 5500.0));
        assert_eq!(second.provider, "a");
        assert_eq!(second.reason.to_string(), "BK,SK");

        // b is now far ahead: switch
        let third = decide(&pipeline, &kbps_host(5000.0, 9000.0));
        assert_eq!(third.provider, "b");
        assert_eq!(third.reason.to_string(), "BK,SW");

        let stats = pipeline.stats();
        assert_eq!(stats.decisions, 3);
        assert_eq!(stats.sticky_kept, 1);
        assert_eq!(stats.sticky_switched, 2);
    }

    #[test]
    fn test_sticky_skipped_without_key() {
        let pipeline = DecisionPipeline::new(sticky_kbps_config(0.2)).unwrap();
        let mut host = kbps_host(5000.0, 4000.0);
        host.context.asn = None;
        let result = decide(&pipeline, &host);
        assert_eq!(result.reason.to_string(), "BK");
        assert!(pipeline.sticky_store().unwrap().is_empty());
    }

    #[test]
    fn test_composite_score() {
        let config = AppConfig::new(
            providers(&["a", "b", "c"]),
            "a",
            SelectionMode::Composite { rtt_weight: 0.5, kbps_weight: 0.5 },
        );
        let pipeline = DecisionPipeline::new(config).unwrap();
        let host = MemoryHost::default()
            .with_probe(ProbeKind::Avail, [("a", 100.0), ("b", 100.0), ("c", 100.0)])
            .with_probe(ProbeKind::HttpRtt, [("a", 50.0), ("b", 60.0), ("c", 150.0)])
            .with_probe(ProbeKind::HttpKbps, [("a", 1000.0), ("b", 9000.0), ("c", 10000.0)]);

        // a: 0.5*1 + 0 = 0.5, b: 0.5*0.9 + 0.5*0.8889 = 0.894, c: 0 + 0.5 = 0.5
        let result = decide(&pipeline, &host);
        assert_eq!(result.provider, "b");
        assert_eq!(result.reason.to_string(), "BS");
    }

    #[test]
    fn test_weighted_random_respects_weights() {
        let mut config = AppConfig::new(providers(&["a", "b"]), "a", SelectionMode::WeightedRandom);
        config.providers[0].weight = 0.0;
        config.providers[1].weight = 1.0;
        let pipeline = DecisionPipeline::new(config).unwrap();
        let host = MemoryHost::default().with_probe(ProbeKind::Avail, [("a", 100.0), ("b", 100.0)]);

        let mut rng = rng();
        for _ in 0..50 {
            let result = pipeline.decide(&host, &host.context, now(), &mut rng);
            assert_eq!(result.provider, "b");
            assert_eq!(result.reason.to_string(), "WR");
        }
    }

    #[test]
    fn test_weighted_random_excludes_unavailable() {
        let config = AppConfig::new(providers(&["a", "b"]), "a", SelectionMode::WeightedRandom);
        let pipeline = DecisionPipeline::new(config).unwrap();
        let host = MemoryHost::default().with_probe(ProbeKind::Avail, [("a", 10.0), ("b", 100.0)]);
        let mut rng = rng();
        for _ in 0..50 {
            assert_eq!(pipeline.decide(&host, &host.context, now(), &mut rng).provider, "b");
        }
    }

    #[test]
    fn test_handle_emits_once_and_init_registers() {
        let pipeline = DecisionPipeline::new(rtt_config()).unwrap();
        let mut host = healthy_host();
        pipeline.init(&mut host);
        assert_eq!(host.registered, vec!["a", "b", "c"]);

        let ctx = host.context.clone();
        let result = pipeline.handle(&mut host, &ctx);
        assert_eq!(host.response.calls, 3);
        assert_eq!(
            host.response.answer,
            Some(("b".to_string(), "b.cdn.net".to_string()))
        );
        assert_eq!(host.response.ttl, Some(result.ttl));
        assert_eq!(host.response.reason.as_deref(), Some("BR"));
    }

    #[test]
    fn test_shared_state_across_pipelines() {
        let store = Arc::new(StickyStore::new(100, 2));
        let rings = Arc::new(RingCache::new(8));
        let a = DecisionPipeline::with_shared_state(
            sticky_kbps_config(0.2),
            Some(Arc::clone(&store)),
            Arc::clone(&rings),
        )
        .unwrap();
        let b = DecisionPipeline::with_shared_state(
            sticky_kbps_config(0.2),
            Some(Arc::clone(&store)),
            rings,
        )
        .unwrap();

        assert_eq!(decide(&a, &kbps_host(5000.0, 4000.0)).provider, "a");
        // The second pipeline sees the first one's sticky choice
        let result = decide(&b, &kbps_host(5000.0, 5500.0));
        assert_eq!(result.provider, "a");
        assert_eq!(result.reason.to_string(), "BK,SK");
    }

    #[test]
    fn test_pipeline_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DecisionPipeline>();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = rtt_config();
        config.overrides.asn.insert(1, "missing".into());
        assert!(DecisionPipeline::new(config).is_err());
    }

    fn arb_table() -> impl Strategy<Value = Vec<(String, f64)>> {
        prop::collection::vec(
            (
                prop::sample::select(vec!["a", "b", "c", "zz"]).prop_map(String::from),
                prop_oneof![Just(f64::NAN), -10.0f64..1000.0, Just(f64::INFINITY)],
            ),
            0..5,
        )
    }

    fn arb_payload() -> impl Strategy<Value = String> {
        prop_oneof![
            (0.0f64..10.0).prop_map(|v| format!(r#"{{"health": {}, "mbps": {}}}"#, v, v * 10_000.0)),
            Just("{".to_string()),
            Just("null".to_string()),
            "[a-z]{0,8}",
        ]
    }

    proptest! {
        #[test]
        fn prop_always_answers(
            avail in arb_table(),
            rtt in arb_table(),
            kbps in arb_table(),
            feed in prop::collection::vec((prop::sample::select(vec!["a", "b", "c"]), arb_payload()), 0..4),
            asn in prop::option::of(0u32..5000),
            complete in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let mut config = health_config();
            config.require_complete_data = complete;
            config.tie_tolerance = 0.1;
            config.tie_break = TieBreak::HashRing { replicas: 10, salt: "s".into() };
            config.usage = Some(FeedSpec::new("fusion", "mbps"));
            config.providers[0].burst_tiers = TierTable::new(vec![PaddingTier { threshold: 20_000.0, multiplier: 1.2 }]);
            config.sticky = Some(StickyConfig { capacity: 10, shards: 2, variance_threshold: 0.1, key: StickyKey::Asn });
            let pipeline = DecisionPipeline::new(config).unwrap();

            let mut host = MemoryHost::default()
                .with_probe(ProbeKind::Avail, avail)
                .with_probe(ProbeKind::HttpRtt, rtt)
                .with_probe(ProbeKind::HttpKbps, kbps)
                .with_feed("fusion", feed);
            host.context.asn = asn;

            let result = pipeline.decide(&host, &host.context, now(), &mut StdRng::seed_from_u64(seed));
            prop_assert!(["a", "b", "c"].contains(&result.provider.as_str()));
            prop_assert!(result.ttl > 0);
            prop_assert!(!result.reason.is_empty());
            prop_assert_eq!(result.cname, format!("{}.cdn.net", result.provider));
        }
    }
}
