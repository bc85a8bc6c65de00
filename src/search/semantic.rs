//! Semantic ranker: embed the query, then nearest chunks per entity

use serde::Serialize;
use std::sync::Arc;

use crate::embeddings::EmbeddingStore;
use crate::errors::{EmbedError, Result};
use crate::health::{Admission, ProviderHealthMonitor};
use crate::provider::EmbeddingProvider;

/// Best-matching chunk of an entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SemanticMatch {
    pub entity_id: i64,
    pub chunk_index: u32,
    pub similarity: f64,
}

pub struct SemanticRanker {
    provider: Arc<dyn EmbeddingProvider>,
    monitor: Arc<ProviderHealthMonitor>,
    store: Arc<EmbeddingStore>,
}

impl SemanticRanker {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        monitor: Arc<ProviderHealthMonitor>,
        store: Arc<EmbeddingStore>,
    ) -> Self {
        Self {
            provider,
            monitor,
            store,
        }
    }

    /// Entities ranked by their best chunk similarity, best first.
    ///
    /// Fails with [`EmbedError::CircuitOpen`] when the breaker refuses the
    /// query embedding call.
    pub async fn rank(
        &self,
        query: &str,
        entity_type: &str,
        min_similarity: f64,
        limit: usize,
    ) -> Result<Vec<SemanticMatch>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        if self.monitor.try_acquire() == Admission::Rejected {
            return Err(EmbedError::CircuitOpen {
                provider: self.monitor.provider().to_string(),
            });
        }

        let embedding = match self.provider.embed(query).await {
            Ok(embedding) => {
                self.monitor.record_success();
                embedding
            }
            Err(e) => {
                self.monitor.record_failure(&e);
                return Err(e.into());
            }
        };

        let matches = self
            .store
            .semantic_search_entities(entity_type, &embedding.vector, min_similarity, limit)?
            .into_iter()
            .map(|hit| SemanticMatch {
                entity_id: hit.entity_id,
                chunk_index: hit.chunk_index,
                similarity: hit.similarity,
            })
            .collect();
        Ok(matches)
    }
}
