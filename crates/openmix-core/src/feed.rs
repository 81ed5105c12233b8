//! Custom JSON feed parsing (Fusion / Sonar)
//!
//! Feeds arrive as one raw JSON string per provider. Only a single numeric
//! field is pulled out of each payload; the rest is opaque.

use crate::host::FeedTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// How parse failures are contained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    /// Skip the failing provider and keep the rest
    #[default]
    PerKey,
    /// Any failure discards the whole feed
    Batch,
}

/// Which feed to read and which field to extract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSpec {
    /// Feed name passed to the host
    pub name: String,
    /// Dotted path to the numeric field, e.g. `bandwidth.mbps`
    pub field: String,
    /// Failure containment
    #[serde(default)]
    pub mode: ParseMode,
}

impl FeedSpec {
    /// Per-key feed spec
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            mode: ParseMode::PerKey,
        }
    }

    /// Switch to batch containment
    pub fn batch(mut self) -> Self {
        self.mode = ParseMode::Batch;
        self
    }
}

/// Numeric side table extracted from a feed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    /// alias -> extracted value
    pub values: HashMap<String, f64>,
    /// Aliases whose payload could not be used
    pub failed: Vec<String>,
    /// Whole feed discarded (batch mode)
    pub batch_failed: bool,
}

impl ParsedFeed {
    /// No usable data at all
    pub fn is_absent(&self) -> bool {
        self.values.is_empty()
    }
}

/// Extract `spec.field` from every payload in `raw`
pub fn parse_feed(raw: &FeedTable, spec: &FeedSpec) -> ParsedFeed {
    let mut parsed = ParsedFeed::default();

    for (alias, payload) in raw {
        match extract(payload, &spec.field) {
            Some(value) => {
                parsed.values.insert(alias.clone(), value);
            }
            None => {
                tracing::warn!(feed = %spec.name, alias = %alias, "unusable feed entry");
                if spec.mode == ParseMode::Batch {
                    return ParsedFeed {
                        batch_failed: true,
                        ..ParsedFeed::default()
                    };
                }
                parsed.failed.push(alias.clone());
            }
        }
    }

    parsed.failed.sort();
    parsed
}

/// Parse `payload` and follow `path`. Numbers and numeric strings are accepted.
fn extract(payload: &str, path: &str) -> Option<f64> {
    let root: Value = serde_json::from_str(payload).ok()?;
    let mut node = &root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        node = node.get(segment)?;
    }
    let value = match node {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => return None,
    };
    value.is_finite().then_some(value)
}
