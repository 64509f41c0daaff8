//! Error types for choicefit
//!
//! Sampler failures are recoverable (the convergence runner counts them as
//! non-improving attempts). Malformed sessions and corrupted stores are fatal
//! for the session or task they belong to, never for the whole run.

use crate::session::SessionKey;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a sampling engine for a single attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerFailure {
    /// Chains diverged or the target density became non-finite mid-run
    #[error("sampler diverged: {0}")]
    Divergence(String),

    /// Summary statistic is NaN or infinite
    #[error("non-finite {statistic} for parameter '{param}'")]
    NonFinite {
        /// Parameter name
        param: String,
        /// Which statistic (mean, sd, rhat, ...)
        statistic: &'static str,
    },

    /// Chains never moved, so the within-chain variance is zero
    #[error("degenerate chains for parameter '{0}' (zero within-chain variance)")]
    Degenerate(String),

    /// No finite starting point could be drawn inside the prior bounds
    #[error("failed to initialize chain {chain} after {tries} tries")]
    Initialization {
        /// Chain index
        chain: usize,
        /// Number of draws attempted
        tries: usize,
    },

    /// Sampler configuration cannot produce a valid run
    #[error("invalid sampler configuration: {0}")]
    InvalidConfig(String),
}

/// choicefit error types
#[derive(Error, Debug)]
pub enum Error {
    /// A sampling attempt failed
    #[error("Sampler failure: {0}")]
    Sampler(#[from] SamplerFailure),

    /// Session data violates a trial invariant; the session is rejected before scheduling
    #[error("Malformed session {subject}/day {day} ({task}): {reason}")]
    MalformedSession {
        /// Subject identifier
        subject: String,
        /// Session day
        day: u32,
        /// Task identifier
        task: String,
        /// What was wrong with the data
        reason: String,
    },

    /// Persisted per-task store cannot be trusted
    #[error("Store for task '{task}' is corrupted: {reason}\nRegenerate it with a full reset; partial results are never merged.")]
    StoreCorrupted {
        /// Task identifier
        task: String,
        /// Decode or schema failure
        reason: String,
    },

    /// The same session was submitted twice
    #[error("Duplicate session scheduled: {0}")]
    DuplicateSession(SessionKey),

    /// Configuration value out of range or unparseable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Caller passed data of the wrong shape
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage error (Parquet/Arrow)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error only affects one attempt and the caller may retry.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Sampler(_))
    }
}
