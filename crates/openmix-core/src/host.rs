//! Boundary with the hosting Openmix runtime
//!
//! The runtime owns transport and telemetry collection. The pipeline only
//! sees these traits: it reads probe and feed tables from a [`DataSource`],
//! registers its providers once with a [`ProviderRegistry`], and commits each
//! decision through a [`ResponseSink`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Probe table: alias -> measured value
pub type ProbeTable = HashMap<String, f64>;

/// Raw feed table: alias -> unparsed payload (usually JSON)
pub type FeedTable = HashMap<String, String>;

/// Platform probe kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Availability percentage (0-100)
    Avail,
    /// HTTP round-trip time in milliseconds
    HttpRtt,
    /// HTTP throughput in kilobits per second
    HttpKbps,
}

/// Request-scoped context supplied by the runtime.
///
/// Every field is optional; absence only means no override can match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    /// ISO country code of the resolver
    pub country: Option<String>,
    /// Market (continent) code
    pub market: Option<String>,
    /// State or region code
    pub state: Option<String>,
    /// Requester autonomous system number
    pub asn: Option<u32>,
    /// Leftmost label of the queried hostname
    pub hostname_prefix: Option<String>,
}

/// Synchronous access to telemetry for the current request
pub trait DataSource {
    /// Probe values for `kind`; empty when the platform has no data
    fn probe(&self, kind: ProbeKind) -> ProbeTable;

    /// Raw per-provider payloads for the named feed; empty when absent
    fn feed(&self, name: &str) -> FeedTable;
}

/// One-time registration of every alias the app may answer with
pub trait ProviderRegistry {
    /// Register `alias` as a valid answer
    fn require_provider(&mut self, alias: &str);
}

/// Commit point for a decision; each method is called exactly once per request
pub trait ResponseSink {
    /// Answer with `alias` and its CNAME (or address)
    fn respond(&mut self, alias: &str, target: &str);

    /// DNS TTL in seconds
    fn set_ttl(&mut self, ttl: u32);

    /// Operator-facing reason code
    fn set_reason_code(&mut self, reason: &str);
}

/// In-memory host used for replaying fixtures and in tests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryHost {
    /// Request context
    pub context: RequestContext,
    /// Probe tables by kind
    pub probes: HashMap<ProbeKind, ProbeTable>,
    /// Raw feed tables by name
    pub feeds: HashMap<String, FeedTable>,
    /// Aliases registered through [`ProviderRegistry`]
    #[serde(skip)]
    pub registered: Vec<String>,
    /// Captured response calls
    #[serde(skip)]
    pub response: CapturedResponse,
}

/// Record of the sink calls made for one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedResponse {
    /// `(alias, target)` passed to `respond`
    pub answer: Option<(String, String)>,
    /// TTL passed to `set_ttl`
    pub ttl: Option<u32>,
    /// Reason passed to `set_reason_code`
    pub reason: Option<String>,
    /// Total number of sink calls
    pub calls: usize,
}

impl MemoryHost {
    /// Create an empty host for `context`
    pub fn new(context: RequestContext) -> Self {
        Self {
            context,
            ..Self::default()
        }
    }

    /// Set a probe table from `(alias, value)` pairs
    pub fn with_probe<I, S>(mut self, kind: ProbeKind, values: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.probes.insert(
            kind,
            values.into_iter().map(|(alias, v)| (alias.into(), v)).collect(),
        );
        self
    }

    /// Set a raw feed from `(alias, payload)` pairs
    pub fn with_feed<I, S, P>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<String>,
    {
        self.feeds.insert(
            name.to_string(),
            values
                .into_iter()
                .map(|(alias, payload)| (alias.into(), payload.into()))
                .collect(),
        );
        self
    }

    /// Forget any captured response so the host can serve another request
    pub fn reset_response(&mut self) {
        self.response = CapturedResponse::default();
    }
}

impl DataSource for MemoryHost {
    fn probe(&self, kind: ProbeKind) -> ProbeTable {
        self.probes.get(&kind).cloned().unwrap_or_default()
    }

    fn feed(&self, name: &str) -> FeedTable {
        self.feeds.get(name).cloned().unwrap_or_default()
    }
}

impl ProviderRegistry for MemoryHost {
    fn require_provider(&mut self, alias: &str) {
        if !self.registered.iter().any(|a| a == alias) {
            self.registered.push(alias.to_string());
        }
    }
}

impl ResponseSink for MemoryHost {
    fn respond(&mut self, alias: &str, target: &str) {
        self.response.answer = Some((alias.to_string(), target.to_string()));
        self.response.calls += 1;
    }

    fn set_ttl(&mut self, ttl: u32) {
        self.response.ttl = Some(ttl);
        self.response.calls += 1;
    }

    fn set_reason_code(&mut self, reason: &str) {
        self.response.reason = Some(reason.to_string());
        self.response.calls += 1;
    }
}
