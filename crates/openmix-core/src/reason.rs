//! Reason codes
//!
//! Internally a decision carries an ordered list of tags. They are only joined
//! into the comma-separated wire string when the response is committed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a branch of the pipeline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonTag {
    /// ASN override matched
    AsnOverride,
    /// Hostname-prefix override matched
    HostnameOverride,
    /// State/country/market override matched
    GeoOverride,
    /// Probe data sparse or missing
    DataMissing,
    /// Every candidate below the availability threshold
    AllBelowAvailability,
    /// Every candidate failed the health feed
    AllUnhealthy,
    /// Health or usage feed could not be parsed as a whole
    FeedError,
    /// Individual feed entries could not be parsed
    FeedEntryError,
    /// Usage data for padding/penalties missing
    PaddingDataMissing,
    /// Lowest adjusted RTT won
    BestRtt,
    /// Highest adjusted throughput won
    BestKbps,
    /// Best composite score won
    BestScore,
    /// Weighted random choice among survivors
    WeightedRandom,
    /// Tie broken by highest throughput
    KbpsTieBreak,
    /// Tie broken on the consistent hash ring
    HashRingTieBreak,
    /// Previous sticky choice kept
    StickyKept,
    /// Sticky choice switched (or first recorded)
    StickySwitched,
    /// Degraded: highest availability
    HighestAvailability,
    /// Degraded: random provider
    RandomProvider,
    /// Degraded: previous sticky choice
    PreviousSticky,
    /// Degraded: configured default provider
    DefaultProvider,
}

impl ReasonTag {
    /// Short wire code
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AsnOverride => "AO",
            Self::HostnameOverride => "HO",
            Self::GeoOverride => "GO",
            Self::DataMissing => "DM",
            Self::AllBelowAvailability => "AB",
            Self::AllUnhealthy => "AU",
            Self::FeedError => "FE",
            Self::FeedEntryError => "FK",
            Self::PaddingDataMissing => "PM",
            Self::BestRtt => "BR",
            Self::BestKbps => "BK",
            Self::BestScore => "BS",
            Self::WeightedRandom => "WR",
            Self::KbpsTieBreak => "KT",
            Self::HashRingTieBreak => "HR",
            Self::StickyKept => "SK",
            Self::StickySwitched => "SW",
            Self::HighestAvailability => "HA",
            Self::RandomProvider => "RP",
            Self::PreviousSticky => "PS",
            Self::DefaultProvider => "DP",
        }
    }

    /// Whether the tag marks a degraded decision that should be retried soon
    pub const fn is_degraded(&self) -> bool {
        matches!(
            self,
            Self::DataMissing
                | Self::AllBelowAvailability
                | Self::AllUnhealthy
                | Self::FeedError
        )
    }
}

impl fmt::Display for ReasonTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Ordered, de-duplicated set of reason tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCode(Vec<ReasonTag>);

impl ReasonCode {
    /// Empty reason
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `tag` unless already present
    pub fn push(&mut self, tag: ReasonTag) {
        if !self.0.contains(&tag) {
            self.0.push(tag);
        }
    }

    /// Check for a tag
    pub fn contains(&self, tag: ReasonTag) -> bool {
        self.0.contains(&tag)
    }

    /// Tags in insertion order
    pub fn tags(&self) -> &[ReasonTag] {
        &self.0
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Any degraded tag present
    pub fn is_degraded(&self) -> bool {
        self.0.iter().any(ReasonTag::is_degraded)
    }
}

impl From<ReasonTag> for ReasonCode {
    fn from(tag: ReasonTag) -> Self {
        Self(vec![tag])
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(tag.code())?;
        }
        Ok(())
    }
}
