//! Application configuration
//!
//! One immutable [`AppConfig`] describes an Openmix app: its providers, the
//! filters it runs and how it selects. It is validated once at startup and
//! shared read-only by every request.

use crate::error::{OpenmixError, OpenmixResult};
use crate::feed::FeedSpec;
use crate::host::{ProbeKind, RequestContext};
use crate::pool::Extremum;
use crate::scoring::{StaticPadding, TierTable, UsageTarget};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One selectable provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Alias registered with the host
    pub alias: String,
    /// CNAME (or address) answered
    pub cname: String,
    /// Relative weight for weighted-random selection
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Fixed padding
    #[serde(default)]
    pub padding: StaticPadding,
    /// Burst pricing tiers applied to the usage feed value
    #[serde(default)]
    pub burst_tiers: TierTable,
    /// Monthly usage window applied to the usage feed value
    #[serde(default)]
    pub usage_target: Option<UsageTarget>,
}

impl ProviderConfig {
    /// Provider with no padding
    pub fn new(alias: impl Into<String>, cname: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            cname: cname.into(),
            weight: default_weight(),
            padding: StaticPadding::default(),
            burst_tiers: TierTable::default(),
            usage_target: None,
        }
    }
}

/// How the winner is picked among survivors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectionMode {
    /// Lowest adjusted HTTP RTT
    BestRtt,
    /// Highest adjusted HTTP throughput
    BestKbps,
    /// Weighted sum of normalized RTT and throughput
    Composite {
        /// Weight of normalized RTT
        rtt_weight: f64,
        /// Weight of normalized throughput
        kbps_weight: f64,
    },
    /// Random choice weighted by provider weight
    WeightedRandom,
}

impl SelectionMode {
    /// Probes that must cover every provider for a confident decision
    pub fn required_probes(&self) -> &'static [ProbeKind] {
        match self {
            Self::BestRtt => &[ProbeKind::HttpRtt],
            Self::BestKbps => &[ProbeKind::HttpKbps],
            Self::Composite { .. } => &[ProbeKind::HttpRtt, ProbeKind::HttpKbps],
            Self::WeightedRandom => &[],
        }
    }

    /// Direction of the adjusted score
    pub fn direction(&self) -> Extremum {
        match self {
            Self::BestRtt => Extremum::Min,
            Self::BestKbps | Self::Composite { .. } | Self::WeightedRandom => Extremum::Max,
        }
    }
}

/// How near-equal winners are separated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the extremum winner
    #[default]
    None,
    /// Highest HTTP throughput among the ties
    Kbps,
    /// Consistent hash of the requester ASN over the ties
    HashRing {
        /// Virtual points per target
        replicas: u32,
        /// Salt mixed into each point
        #[serde(default)]
        salt: String,
    },
}

/// Fallback used when probe data is sparse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedStrategy {
    /// Highest availability among providers with data
    #[default]
    HighestAvailability,
    /// Uniformly random provider
    Random,
    /// Previous sticky choice for the routing key
    Sticky,
    /// Configured default provider
    Default,
}

/// What identifies a client population for stickiness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickyKey {
    /// Requester ASN
    #[default]
    Asn,
    /// Country code
    Country,
    /// Market code
    Market,
    /// Country and ASN together
    CountryAsn,
}

impl StickyKey {
    /// Routing key for `ctx`, `None` when the needed fields are absent
    pub fn derive(&self, ctx: &RequestContext) -> Option<String> {
        match self {
            Self::Asn => ctx.asn.map(|asn| asn.to_string()),
            Self::Country => ctx.country.clone(),
            Self::Market => ctx.market.clone(),
            Self::CountryAsn => match (&ctx.country, ctx.asn) {
                (Some(country), Some(asn)) => Some(format!("{}:{}", country, asn)),
                _ => None,
            },
        }
    }
}

/// Sticky store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickyConfig {
    /// Total routing keys remembered across all shards
    #[serde(default = "default_sticky_capacity")]
    pub capacity: usize,
    /// Lock shards
    #[serde(default = "default_sticky_shards")]
    pub shards: usize,
    /// Relative slack within which the previous choice is kept
    pub variance_threshold: f64,
    /// Routing key source
    #[serde(default)]
    pub key: StickyKey,
}

/// Static overrides, checked most specific first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    /// ASN -> alias
    pub asn: HashMap<u32, String>,
    /// Hostname prefix -> alias
    pub hostname_prefix: HashMap<String, String>,
    /// State -> alias
    pub state: HashMap<String, String>,
    /// Country -> alias
    pub country: HashMap<String, String>,
    /// Market -> alias
    pub market: HashMap<String, String>,
}

impl Overrides {
    /// Every `(field, alias)` pair referenced by the overrides
    fn targets(&self) -> impl Iterator<Item = (&'static str, &String)> {
        self.asn
            .values()
            .map(|a| ("overrides.asn", a))
            .chain(self.hostname_prefix.values().map(|a| ("overrides.hostname_prefix", a)))
            .chain(self.state.values().map(|a| ("overrides.state", a)))
            .chain(self.country.values().map(|a| ("overrides.country", a)))
            .chain(self.market.values().map(|a| ("overrides.market", a)))
    }
}

/// Health feed filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Feed and field to read
    pub feed: FeedSpec,
    /// Minimum score to stay in the pool
    pub threshold: f64,
}

/// Complete configuration of one Openmix app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Selectable providers
    pub providers: Vec<ProviderConfig>,
    /// Last-resort answer
    pub default_provider: String,
    /// TTL for confident decisions
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,
    /// TTL for degraded decisions
    #[serde(default = "default_error_ttl")]
    pub error_ttl: u32,
    /// Availability threshold (percent)
    #[serde(default = "default_availability_threshold")]
    pub availability_threshold: f64,
    /// Per-country availability thresholds
    #[serde(default)]
    pub country_availability: HashMap<String, f64>,
    /// Degrade when any required probe misses a provider
    #[serde(default = "default_true")]
    pub require_complete_data: bool,
    /// Fallback for sparse data
    #[serde(default)]
    pub degraded: DegradedStrategy,
    /// Winner selection
    pub selection: SelectionMode,
    /// Relative slack defining a tie
    #[serde(default)]
    pub tie_tolerance: f64,
    /// Tie resolution
    #[serde(default)]
    pub tie_break: TieBreak,
    /// Static overrides
    #[serde(default)]
    pub overrides: Overrides,
    /// Optional health filter
    #[serde(default)]
    pub health: Option<HealthConfig>,
    /// Optional usage feed for burst tiers and usage targets
    #[serde(default)]
    pub usage: Option<FeedSpec>,
    /// Optional stickiness
    #[serde(default)]
    pub sticky: Option<StickyConfig>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_ttl() -> u32 {
    20
}

fn default_error_ttl() -> u32 {
    10
}

fn default_availability_threshold() -> f64 {
    90.0
}

fn default_true() -> bool {
    true
}

fn default_sticky_capacity() -> usize {
    10_000
}

fn default_sticky_shards() -> usize {
    16
}

impl AppConfig {
    /// Config with default thresholds and TTLs
    pub fn new(
        providers: Vec<ProviderConfig>,
        default_provider: impl Into<String>,
        selection: SelectionMode,
    ) -> Self {
        Self {
            providers,
            default_provider: default_provider.into(),
            default_ttl: default_ttl(),
            error_ttl: default_error_ttl(),
            availability_threshold: default_availability_threshold(),
            country_availability: HashMap::new(),
            require_complete_data: true,
            degraded: DegradedStrategy::default(),
            selection,
            tie_tolerance: 0.0,
            tie_break: TieBreak::None,
            overrides: Overrides::default(),
            health: None,
            usage: None,
            sticky: None,
        }
    }

    /// Parse JSON
    pub fn from_json_str(content: &str) -> OpenmixResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Parse TOML
    pub fn from_toml_str(content: &str) -> OpenmixResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a `.toml` or JSON file and validate
    pub fn load(path: impl AsRef<Path>) -> OpenmixResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            _ => Self::from_json_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Provider by alias
    pub fn provider(&self, alias: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.alias == alias)
    }

    /// Availability threshold for the request's country
    pub fn availability_threshold_for(&self, country: Option<&str>) -> f64 {
        country
            .and_then(|c| self.country_availability.get(c))
            .copied()
            .unwrap_or(self.availability_threshold)
    }

    /// Check internal consistency
    pub fn validate(&self) -> OpenmixResult<()> {
        if self.providers.is_empty() {
            return Err(OpenmixError::InvalidConfig("no providers configured".into()));
        }

        let mut aliases = HashSet::new();
        for provider in &self.providers {
            if provider.alias.is_empty() {
                return Err(OpenmixError::InvalidConfig("empty provider alias".into()));
            }
            if !aliases.insert(provider.alias.as_str()) {
                return Err(OpenmixError::InvalidConfig(format!(
                    "duplicate provider alias `{}`",
                    provider.alias
                )));
            }
            if !(provider.weight >= 0.0) || !provider.weight.is_finite() {
                return Err(OpenmixError::InvalidConfig(format!(
                    "provider `{}` has invalid weight",
                    provider.alias
                )));
            }
        }

        let check = |alias: &String, referenced_by: &str| -> OpenmixResult<()> {
            if aliases.contains(alias.as_str()) {
                Ok(())
            } else {
                Err(OpenmixError::UnknownProvider {
                    alias: alias.clone(),
                    referenced_by: referenced_by.to_string(),
                })
            }
        };

        check(&self.default_provider, "default_provider")?;
        for (field, alias) in self.overrides.targets() {
            check(alias, field)?;
        }

        if self.default_ttl == 0 || self.error_ttl == 0 {
            return Err(OpenmixError::InvalidConfig("TTLs must be positive".into()));
        }
        if !self.availability_threshold.is_finite()
            || self.country_availability.values().any(|t| !t.is_finite())
        {
            return Err(OpenmixError::InvalidConfig("availability thresholds must be finite".into()));
        }
        if !(self.tie_tolerance >= 0.0) {
            return Err(OpenmixError::InvalidConfig("tie_tolerance must be >= 0".into()));
        }
        if let TieBreak::HashRing { replicas, .. } = &self.tie_break {
            if *replicas == 0 {
                return Err(OpenmixError::InvalidConfig("hash ring needs at least one replica".into()));
            }
        }
        if let SelectionMode::Composite { rtt_weight, kbps_weight } = &self.selection {
            if !(*rtt_weight >= 0.0 && *kbps_weight >= 0.0) || rtt_weight + kbps_weight <= 0.0 {
                return Err(OpenmixError::InvalidConfig("composite weights must be non-negative and not both zero".into()));
            }
        }
        if let Some(sticky) = &self.sticky {
            if sticky.capacity == 0 || sticky.shards == 0 {
                return Err(OpenmixError::InvalidConfig("sticky capacity and shards must be positive".into()));
            }
            if sticky.shards > sticky.capacity {
                return Err(OpenmixError::InvalidConfig("sticky shards must not exceed capacity".into()));
            }
            if !(sticky.variance_threshold >= 0.0) {
                return Err(OpenmixError::InvalidConfig("variance_threshold must be >= 0".into()));
            }
        }
        if self.degraded == DegradedStrategy::Sticky && self.sticky.is_none() {
            return Err(OpenmixError::InvalidConfig("sticky degraded strategy requires sticky config".into()));
        }
        Ok(())
    }
}
