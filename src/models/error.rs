//! Error types for tollgate.
//!
//! Taxonomy:
//! - Setup failures: abort the run before any item is processed
//! - Provider failures: transient (retried) or permanent, and in both cases
//!   recorded against the item as a `CallFailure` rather than raised

use super::Usage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for tollgate.
#[derive(Debug, Error)]
pub enum TollgateError {
    // ═══════════════════════════════════════════════════════════════════
    // FATAL SETUP: nothing is processed
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("No usable credentials configured for provider '{provider}'")]
    NoCredentials { provider: String },

    #[error("Duplicate item id in source: {0}")]
    DuplicateItemId(String),

    #[error("Checkpoint conflict at {path}: {reason} (pass --force to override)")]
    CheckpointConflict { path: PathBuf, reason: String },

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE
    // ═══════════════════════════════════════════════════════════════════
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TollgateError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error must abort the run before processing begins.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::NoCredentials { .. }
                | Self::DuplicateItemId(_)
                | Self::CheckpointConflict { .. }
        )
    }
}

/// Errors raised by a single provider request.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication rejected for {credential}")]
    Unauthorized { credential: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<f64>,
    },

    #[error("Server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response envelope: {0}")]
    InvalidResponse(String),

    #[error("All credentials have been revoked")]
    CredentialsExhausted,
}

impl ProviderError {
    /// Transient errors are retried with rotation and backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    /// Get retry delay hint in seconds, if the provider sent one.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    /// HTTP status behind this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { .. } => Some(401),
            Self::RateLimited { .. } => Some(429),
            Self::Server { status, .. } | Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Terminal outcome of a provider call after rotation and retries.
#[derive(Debug, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct CallFailure {
    /// Last error observed
    pub error: ProviderError,
    /// Number of HTTP requests made
    pub attempts: u32,
    /// Usage reported by the provider on the failing response, if any
    pub usage: Option<Usage>,
}

impl CallFailure {
    /// Whether the attempt bound was reached on a retryable error.
    pub fn is_exhausted(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Result type alias for tollgate.
pub type Result<T> = std::result::Result<T, TollgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::RateLimited {
            message: "slow down".into(),
            retry_after_secs: Some(2.0)
        }
        .is_retryable());
        assert!(ProviderError::Server {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Rejected {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Unauthorized {
            credential: "key#1".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_fatal_setup_classification() {
        assert!(TollgateError::NoCredentials {
            provider: "openrouter".into()
        }
        .is_fatal_setup());
        assert!(!TollgateError::ParseError("bad".into()).is_fatal_setup());
    }
}
