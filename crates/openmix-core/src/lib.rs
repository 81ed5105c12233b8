//! Openmix DNS Traffic Steering Core
//!
//! Target: one provider answer per DNS request, always
//!
//! # Features
//!
//! - Filter-score-select pipeline over per-provider probe tables
//! - Burst-tier padding and monthly usage-target penalties
//! - Consistent hash ring tie-break keyed by requester ASN
//! - Sharded LRU sticky store shared across requests
//! - Degraded strategies that still answer on sparse data

#![warn(missing_docs)]

pub mod apps;
pub mod config;
pub mod error;
pub mod feed;
pub mod hash_ring;
pub mod host;
pub mod lru;
pub mod pipeline;
pub mod pool;
pub mod reason;
pub mod scoring;
pub mod stats;
pub mod sticky;

pub use config::{AppConfig, DegradedStrategy, ProviderConfig, SelectionMode, StickyConfig, StickyKey, TieBreak};
pub use error::{OpenmixError, OpenmixResult};
pub use feed::{parse_feed, FeedSpec, ParseMode, ParsedFeed};
pub use hash_ring::{fnv1a_32, HashRing, RingCache};
pub use host::{DataSource, MemoryHost, ProbeKind, ProviderRegistry, RequestContext, ResponseSink};
pub use crate::lru::LruCache;
pub use pipeline::{DecisionPipeline, DecisionResult};
pub use pool::{Candidate, CandidatePool, Extremum, Metric};
pub use reason::{ReasonCode, ReasonTag};
pub use scoring::{PaddingTier, StaticPadding, TierTable, UsageTarget};
pub use stats::{PipelineStats, StatsSnapshot};
pub use sticky::{StickyOutcome, StickyStore};
