//! Error types for querybench.
//!
//! Variants are grouped by what went wrong:
//! - B_i falsified: the input or the provider said no (bad config, rejected request)
//! - I^B materialized: infrastructure failed (network, timeout, disk, store)
//! - K_i violated: an internal invariant broke (illegal transition, bug)
//!
//! Failure scopes:
//! - Per model: submission errors are caught by the dispatcher and reported
//! - Per job: poll and fetch errors leave the job record untouched for the next pass
//! - Per line: extraction errors become a sentinel in the canonical output
//! - Shared infrastructure: store corruption is fatal for the whole run

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for querybench.
#[derive(Debug, Error)]
pub enum BatchError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED: input or provider rejected the request
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: infrastructure failed
    // ═══════════════════════════════════════════════════════════════════
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job store {path} is unreadable: {message}")]
    StoreCorruption { path: PathBuf, message: String },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED: invariant broken (bug)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Illegal transition for batch {batch_id}: {from} -> {to}")]
    InvalidTransition {
        batch_id: String,
        from: String,
        to: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by a provider's batch API.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed for {provider}")]
    AuthenticationFailed { provider: String },

    #[error("Batch not found: {0}")]
    NotFound(String),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Batch {batch_id} has no downloadable results yet")]
    ResultsUnavailable { batch_id: String },

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

/// Failure to pull generated text out of one result line.
///
/// Never propagated: the normalizer counts it and writes a sentinel instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("result line is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("provider reported `{0}` for this request")]
    RequestFailed(String),
}

impl BatchError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error must abort the whole run rather than one job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreCorruption { .. })
    }

    /// Check if this error is worth retrying at the transport level.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Provider(ProviderError::ApiError { status, .. }) => {
                *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

/// Result type alias for querybench.
pub type Result<T> = std::result::Result<T, BatchError>;
