//! Ready-made app configurations
//!
//! Each preset wires the common steering strategies onto a provider list.
//! The first provider becomes the default; callers adjust the returned
//! [`AppConfig`] before handing it to [`DecisionPipeline::new`].
//!
//! [`DecisionPipeline::new`]: crate::pipeline::DecisionPipeline::new

use crate::config::{
    AppConfig, DegradedStrategy, HealthConfig, ProviderConfig, SelectionMode, StickyConfig,
    StickyKey, TieBreak,
};
use crate::feed::FeedSpec;
use std::collections::HashMap;

fn default_alias(providers: &[ProviderConfig]) -> String {
    providers.first().map(|p| p.alias.clone()).unwrap_or_default()
}

/// Lowest HTTP RTT among available providers
pub fn best_rtt(providers: Vec<ProviderConfig>) -> AppConfig {
    let default = default_alias(&providers);
    AppConfig::new(providers, default, SelectionMode::BestRtt)
}

/// Highest HTTP throughput among available providers
pub fn best_kbps(providers: Vec<ProviderConfig>) -> AppConfig {
    let default = default_alias(&providers);
    AppConfig::new(providers, default, SelectionMode::BestKbps)
}

/// Random provider in proportion to configured weight
pub fn weighted_random(providers: Vec<ProviderConfig>) -> AppConfig {
    let default = default_alias(&providers);
    let mut config = AppConfig::new(providers, default, SelectionMode::WeightedRandom);
    config.require_complete_data = false;
    config.degraded = DegradedStrategy::Random;
    config
}

/// Best RTT; providers within `tolerance` of the best are spread over a
/// consistent hash ring keyed by requester ASN
pub fn session_persistence(
    providers: Vec<ProviderConfig>,
    tolerance: f64,
    replicas: u32,
    salt: impl Into<String>,
) -> AppConfig {
    let mut config = best_rtt(providers);
    config.tie_tolerance = tolerance;
    config.tie_break = TieBreak::HashRing {
        replicas,
        salt: salt.into(),
    };
    config
}

/// Best throughput that only moves a country+ASN population when the new
/// winner beats the remembered one by more than `variance`
pub fn sticky_kbps(providers: Vec<ProviderConfig>, variance: f64, capacity: usize) -> AppConfig {
    let mut config = best_kbps(providers);
    config.sticky = Some(StickyConfig {
        capacity,
        shards: 16,
        variance_threshold: variance,
        key: StickyKey::CountryAsn,
    });
    config.degraded = DegradedStrategy::Sticky;
    config
}

/// Best RTT with burst tiers and usage targets driven by a usage feed.
///
/// Tiers and targets live on each [`ProviderConfig`].
pub fn usage_aware_rtt(providers: Vec<ProviderConfig>, usage: FeedSpec) -> AppConfig {
    let mut config = best_rtt(providers);
    config.usage = Some(usage);
    config
}

/// Best RTT restricted to providers the health feed scores at or above `threshold`
pub fn health_filtered_rtt(providers: Vec<ProviderConfig>, health: FeedSpec, threshold: f64) -> AppConfig {
    let mut config = best_rtt(providers);
    config.health = Some(HealthConfig {
        feed: health,
        threshold,
    });
    config
}

/// Best RTT with per-country and per-market pinning
pub fn geo_override(
    providers: Vec<ProviderConfig>,
    countries: HashMap<String, String>,
    markets: HashMap<String, String>,
) -> AppConfig {
    let mut config = best_rtt(providers);
    config.overrides.country = countries;
    config.overrides.market = markets;
    config
}
