//! Embedding provider gateway
//!
//! The gateway turns text into a vector and reports whether it is reachable.
//! Failures are classified as [`ProviderError::Transient`] or
//! [`ProviderError::Permanent`]; workers and the circuit breaker act on that
//! classification only.

pub mod noop;
pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

pub use noop::NoOpProvider;
pub use ollama::OllamaProvider;

/// A computed embedding and the model that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
}

/// Remote text-to-vector provider
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable provider name, used as the health record key
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError>;

    async fn health_check(&self) -> bool;
}
