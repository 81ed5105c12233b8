//! Error types for Openmix
//!
//! Only startup paths (loading and validating configuration) return these.
//! Per-request data problems are folded into reason codes instead.

use thiserror::Error;

/// Openmix error type
#[derive(Error, Debug)]
pub enum OpenmixError {
    /// Configuration is structurally valid but semantically wrong
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A default or override points at an alias that is not a configured provider
    #[error("unknown provider `{alias}` referenced by {referenced_by}")]
    UnknownProvider {
        /// The unregistered alias
        alias: String,
        /// Which config field referenced it
        referenced_by: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML decode error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for Openmix
pub type OpenmixResult<T> = Result<T, OpenmixError>;
