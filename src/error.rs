//! Process-wide error taxonomy.
//!
//! Every fallible boundary in the pipeline surfaces one of these kinds.
//! Clients recover `Transient` and `RateLimited` internally; everything
//! else propagates to the caller. Per-event failures become dead-letter
//! records, component failures become process exits (see `main.rs` for
//! the exit-code mapping).

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The error taxonomy.
///
/// `kind()` gives the stable machine-readable name used in API error
/// bodies and dead-letter records.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed input. Never retried, surfaced to the caller, logged once.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Token bucket exhausted within the caller's deadline.
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    /// Network error, 5xx response, or I/O timeout. Retried internally
    /// with bounded backoff before being surfaced.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Circuit breaker open or dependency declared down. Fail fast.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Feature vector schema does not match the model's expected schema.
    /// Fatal to the call, not to the process.
    #[error("schema mismatch: model expects '{expected}', got '{got}'")]
    SchemaMismatch { expected: String, got: String },

    /// Cancelled by deadline. Safe to retry with a fresh deadline if the
    /// operation is idempotent.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Persisted state unreadable. Fatal to the process (exit code 2).
    #[error("store corruption: {0}")]
    Corruption(String),

    /// Lookup miss on a caller-supplied id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Catch-all bug indicator.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable kind name for API bodies, dead-letter
    /// records, and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::Transient(_) => "transient",
            PipelineError::Unavailable(_) => "unavailable",
            PipelineError::SchemaMismatch { .. } => "schema_mismatch",
            PipelineError::DeadlineExceeded(_) => "deadline_exceeded",
            PipelineError::Corruption(_) => "corruption",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Internal(_) => "internal",
        }
    }

    /// Whether the client layer may retry this error internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transient(_) | PipelineError::RateLimited { .. }
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

impl From<sled::Error> for PipelineError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { .. } => PipelineError::Corruption(err.to_string()),
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::DeadlineExceeded(Duration::ZERO)
        } else {
            PipelineError::Transient(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(PipelineError::Validation("x".into()).kind(), "validation");
        assert_eq!(
            PipelineError::RateLimited { retry_after_ms: 10 }.kind(),
            "rate_limited"
        );
        assert_eq!(PipelineError::Corruption("x".into()).kind(), "corruption");
    }

    #[test]
    fn retryable_split() {
        assert!(PipelineError::Transient("net".into()).is_retryable());
        assert!(PipelineError::RateLimited { retry_after_ms: 1 }.is_retryable());
        assert!(!PipelineError::Validation("bad".into()).is_retryable());
        assert!(!PipelineError::Unavailable("down".into()).is_retryable());
    }

    #[test]
    fn io_error_is_transient() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(PipelineError::from(err).kind(), "transient");
    }
}
