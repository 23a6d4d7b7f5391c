//! Error types for the ingestion orchestration core

use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the orchestration core
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input rejected at submit time (never retried)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A queue, cache, or pool is at capacity
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transient failure from an external dependency (retried with backoff)
    #[error("Transient error: {0}")]
    Transient(String),

    /// Circuit breaker is open; the call was not attempted
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Job or item was cancelled mid-flight (never retried)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A job or call exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Text extraction failed
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Vector store operation failed
    #[error("Vector store error: {0}")]
    Store(String),

    /// Durable storage (queue persistence) failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a failed attempt with this error should be retried.
    ///
    /// Validation, permission, and not-found style failures are permanent;
    /// retrying them only burns attempts against the same outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation(_)
            | Error::Cancelled(_)
            | Error::ResourceExhausted(_)
            | Error::Config(_) => false,
            Error::Transient(_)
            | Error::Timeout(_)
            | Error::CircuitOpen(_)
            | Error::Extraction(_)
            | Error::Embedding(_)
            | Error::Store(_)
            | Error::Persistence(_)
            | Error::Internal(_) => !self.message_is_permanent(),
        }
    }

    /// Message-based classification for errors wrapped by dependencies.
    ///
    /// External collaborators surface permission and not-found failures as
    /// plain messages; those are permanent regardless of the carrier variant.
    fn message_is_permanent(&self) -> bool {
        let msg = self.to_string().to_lowercase();
        msg.contains("validation")
            || msg.contains("permission")
            || msg.contains("unauthorized")
            || msg.contains("forbidden")
            || msg.contains("not found")
    }

    /// Short machine-readable kind, used in metrics and job error records
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Transient(_) => "transient",
            Error::CircuitOpen(_) => "circuit_open",
            Error::Cancelled(_) => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::Extraction(_) => "extraction",
            Error::Embedding(_) => "embedding",
            Error::Store(_) => "store",
            Error::Persistence(_) => "persistence",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transient("connection reset".into()).is_retryable());
        assert!(Error::Timeout("call exceeded 30s".into()).is_retryable());
        assert!(Error::Store("rate limited".into()).is_retryable());
        assert!(!Error::Validation("missing owner".into()).is_retryable());
        assert!(!Error::Cancelled("job cancelled".into()).is_retryable());
    }

    #[test]
    fn test_permanent_messages_not_retryable() {
        assert!(!Error::Store("permission denied for namespace".into()).is_retryable());
        assert!(!Error::Embedding("model not found".into()).is_retryable());
        assert!(Error::Embedding("service unavailable".into()).is_retryable());
    }
}
