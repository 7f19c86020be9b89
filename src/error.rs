// src/error.rs

//! Unified error handling for the deduplication core.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// A creator found in more than one batch of a single partition call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateCreator {
    /// Normalized creator identity
    pub creator: String,
    /// Every batch index the creator appeared in
    pub batches: Vec<usize>,
}

impl fmt::Display for DuplicateCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in batches {:?}", self.creator, self.batches)
    }
}

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid configuration (digest algorithm, numeric bounds). Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A conditional write lost the race to another worker.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object store or record table unavailable, throttled, or failing.
    #[error("Store error: {0}")]
    Store(String),

    /// Partition validation found creators in more than one batch.
    #[error("Integrity violation: {} duplicate creator(s): {}", duplicates.len(), format_duplicates(duplicates))]
    Integrity { duplicates: Vec<DuplicateCreator> },

    /// Status change outside the processing state machine
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn format_duplicates(duplicates: &[DuplicateCreator]) -> String {
    duplicates
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a store error from any displayable failure.
    pub fn store(message: impl fmt::Display) -> Self {
        Self::Store(message.to_string())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create an invalid-transition error.
    pub fn transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Io(_))
    }

    /// Whether the error is an expected lost race rather than a failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
