//! Error types for wavecrowd
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::marketplace::MarketplaceError;

/// All error types that can occur while scheduling or reconciling waves
#[derive(Debug, Error)]
pub enum WaveError {
    /// Marketplace call failed (after retries, if any were allowed)
    #[error("Marketplace error: {0}")]
    Marketplace(#[from] MarketplaceError),

    /// A record the caller asked for does not exist locally
    #[error("Unknown reference: {0}")]
    UnknownReference(String),

    /// Stored state contradicts a scheduler invariant
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Missing or malformed configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Corpus data is missing or unreadable
    #[error("Corpus error: {0}")]
    Corpus(String),

    /// Template rendering error
    #[error("Template error: {0}")]
    Template(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WaveError {
    /// Errors that must stop the current pass and surface as a non-zero exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WaveError::InvariantViolation(_) | WaveError::Config(_) | WaveError::Template(_)
        )
    }

    /// Errors that a later invocation may succeed on without any change.
    pub fn is_transient(&self) -> bool {
        match self {
            WaveError::Marketplace(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for wavecrowd operations
pub type Result<T> = std::result::Result<T, WaveError>;
