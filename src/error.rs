//! Error taxonomy for capture and replay
//!
//! Ingestion errors (malformed log lines, unreadable interaction files) are
//! fatal for the whole run. Resolution problems are diagnostics that never
//! abort anything. Replay errors are isolated to the client that hit them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("malformed log line {line}: {reason}: {text:?}")]
    MalformedLogLine {
        line: usize,
        reason: String,
        text: String,
    },

    #[error("unresolved type for parameter ${index}: {reason}")]
    UnresolvedParameterType { index: usize, reason: String },

    #[error("parameter count mismatch: statement has {placeholders} placeholders, {resolved} resolved, {captured} captured values")]
    ParameterCountMismatch {
        placeholders: usize,
        resolved: usize,
        captured: usize,
    },

    #[error("cannot convert parameter ${index} value {value:?} to {type_name}: {reason}")]
    ValueConversion {
        index: usize,
        value: String,
        type_name: String,
        reason: String,
    },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("replay timed out after {elapsed:?}: {pending} client(s) unfinished")]
    Timeout {
        elapsed: std::time::Duration,
        pending: usize,
    },

    #[error("invalid interaction file {path}: {reason}")]
    InteractionFormat { path: String, reason: String },
}

impl ReplayError {
    /// Build a MalformedLogLine error for the 1-based physical line number
    pub fn malformed(line: usize, reason: impl Into<String>, text: &str) -> Self {
        ReplayError::MalformedLogLine {
            line,
            reason: reason.into(),
            text: text.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;
