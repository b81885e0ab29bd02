// src/error.rs
//! Error types for the vigil health engine.

use thiserror::Error;

/// Errors surfaced by the health engine.
///
/// Per-alarm evaluation problems (database errors, expression failures)
/// are *not* errors at this level: they are recorded as alarm flags and
/// the engine keeps running. This enum covers the conditions a caller
/// can actually act on.
#[derive(Error, Debug)]
pub enum HealthError {
    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The silencers file could not be read or parsed.
    #[error("silencers error: {0}")]
    Silencers(String),

    /// A silencer pattern failed to compile.
    #[error("invalid pattern '{pattern}': {reason}")]
    Pattern {
        /// The offending pattern text.
        pattern: String,
        /// Why it failed to compile.
        reason: String,
    },

    /// The notifier program could not be spawned.
    #[error("notifier execution failed: {0}")]
    Notifier(String),

    /// Time-series database lookup failure.
    #[error("database lookup failed: {0}")]
    Lookup(String),

    /// Generic runtime failure.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// I/O error (log persistence, silencers file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HealthError>;
