//! Error types for embedline
//!
//! Two layers: [`ProviderError`] classifies what the embedding gateway said,
//! [`EmbedError`] is the crate-wide error carried through every store,
//! worker and search operation.

use thiserror::Error;

/// Outcome classification for a failed embedding gateway call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout, rate limit or server-side error
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Malformed input, unsupported content, or an unusable response
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Whether the call may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// The bare message without the classification prefix
    pub fn message(&self) -> &str {
        match self {
            ProviderError::Transient(msg) | ProviderError::Permanent(msg) => msg,
        }
    }
}

/// Main error type for the embedding pipeline
#[derive(Error, Debug)]
pub enum EmbedError {
    /// Job state machine transition errors
    #[error("Invalid job transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    /// Job lookup by id failed
    #[error("Embedding job {0} not found")]
    JobNotFound(i64),

    /// Underlying SQLite failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Embedding gateway failure
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Call refused because the provider's circuit breaker is open
    #[error("Circuit open for provider '{provider}'")]
    CircuitOpen { provider: String },

    /// Chunk source could not produce text for an entity
    #[error("Chunk source error: {0}")]
    Source(String),

    /// Entity content that no retry will make readable
    #[error("Unreadable entity content: {0}")]
    InvalidContent(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("Embedding pipeline error: {0}")]
    Generic(String),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Convert anyhow errors to EmbedError
impl From<anyhow::Error> for EmbedError {
    fn from(err: anyhow::Error) -> Self {
        EmbedError::Generic(err.to_string())
    }
}
