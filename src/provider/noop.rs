//! Gateway used when embeddings are disabled

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::provider::{Embedding, EmbeddingProvider};

/// Every embed fails permanently; never healthy
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProvider;

#[async_trait]
impl EmbeddingProvider for NoOpProvider {
    fn name(&self) -> &str {
        "none"
    }

    async fn embed(&self, _text: &str) -> Result<Embedding, ProviderError> {
        Err(ProviderError::Permanent(
            "embeddings are disabled in configuration".to_string(),
        ))
    }

    async fn health_check(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_always_fails_permanently() {
        let provider = NoOpProvider;
        assert!(!provider.embed("text").await.unwrap_err().is_transient());
        assert!(!provider.health_check().await);
    }
}
