//! Error types.
//!
//! Endpoint-level failures are not errors here: they end up as a
//! [`Status`](crate::types::Status) on the endpoint's result. These types
//! cover configuration, inventory loading and run-level failures, plus the
//! parser's internal failure value.

use thiserror::Error;

/// Rejected scan configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("worker count {got} exceeds the maximum of {max}")]
    TooManyWorkers { got: usize, max: usize },

    #[error("{what} timeout must be greater than zero")]
    ZeroTimeout { what: &'static str },

    #[error("limit-ips must be at least 1 when set")]
    ZeroLimit,

    #[error("{what} program path is empty")]
    EmptyProgram { what: &'static str },

    #[error("select endpoints with --all-pods or --namespace <name>")]
    NoSelection,
}

/// Failure to read the discovery collaborator's endpoint list.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("line {line}: {reason}")]
    BadLine { line: usize, reason: String },

    #[error("invalid endpoint JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Run-level failure: no report can be produced.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no endpoints to scan")]
    NoEndpoints,

    #[error("aggregator stopped before the run completed")]
    AggregatorLost,
}

/// Probe output that could not be read as the expected document.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}; near: {fragment:?}")]
pub struct ParseError {
    pub message: String,
    /// Leading part of the raw output, for diagnostics.
    pub fragment: String,
}

/// Longest raw fragment kept in a [`ParseError`].
pub const MAX_FRAGMENT_BYTES: usize = 512;

impl ParseError {
    pub fn new(message: impl Into<String>, raw: &str) -> Self {
        Self {
            message: message.into(),
            fragment: truncate_on_char_boundary(raw, MAX_FRAGMENT_BYTES).to_string(),
        }
    }
}

/// Cut `s` to at most `max` bytes without splitting a UTF-8 sequence.
pub fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Last `max` bytes of `s`, starting on a char boundary.
pub fn tail_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
