//! Keyword rankers

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::embeddings::EmbeddingStore;
use crate::errors::Result;

/// Ranked entity ids for a query, best first
#[async_trait]
pub trait KeywordRanker: Send + Sync {
    async fn rank(&self, query: &str, entity_type: &str, limit: usize) -> Result<Vec<i64>>;
}

/// Term-match ranker over the chunk text kept in the embedding store.
///
/// An entity scores one point per occurrence of each query term across its
/// chunks; entities with no match are left out.
pub struct ChunkTextKeywordRanker {
    store: Arc<EmbeddingStore>,
}

impl ChunkTextKeywordRanker {
    pub fn new(store: Arc<EmbeddingStore>) -> Self {
        Self { store }
    }
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl KeywordRanker for ChunkTextKeywordRanker {
    async fn rank(&self, query: &str, entity_type: &str, limit: usize) -> Result<Vec<i64>> {
        let query_terms = terms(query);
        if query_terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut scores: HashMap<i64, usize> = HashMap::new();
        for (entity_id, text) in self.store.texts_for_type(entity_type)? {
            let matches = terms(&text)
                .iter()
                .filter(|term| query_terms.contains(term))
                .count();
            if matches > 0 {
                *scores.entry(entity_id).or_insert(0) += matches;
            }
        }

        let mut ranked: Vec<(i64, usize)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);

        Ok(ranked.into_iter().map(|(entity_id, _)| entity_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::ChunkEmbedding;
    use crate::storage::Database;

    fn store_with(texts: &[(i64, u32, &str)]) -> Arc<EmbeddingStore> {
        let store = Arc::new(EmbeddingStore::new(Arc::new(
            Database::open_in_memory().unwrap(),
        )));
        for (entity_id, chunk_index, text) in texts {
            store
                .upsert(
                    "DOC",
                    *entity_id,
                    &ChunkEmbedding {
                        chunk_index: *chunk_index,
                        text: text.to_string(),
                        vector: vec![1.0],
                        token_count: 1,
                    },
                    "m",
                )
                .unwrap();
        }
        store
    }

    #[test]
    fn test_terms() {
        assert_eq!(terms("Spring-Boot, actuator!"), vec!["spring", "boot", "actuator"]);
        assert!(terms("  ?! ").is_empty());
    }

    #[tokio::test]
    async fn test_rank_by_match_count() {
        let store = store_with(&[
            (1, 0, "Kafka consumer groups"),
            (2, 0, "Kafka producer and Kafka consumer"),
            (2, 1, "consumer offsets"),
            (3, 0, "Reactive web stack"),
        ]);
        let ranker = ChunkTextKeywordRanker::new(store);

        let ranked = ranker.rank("kafka consumer", "DOC", 10).await.unwrap();
        assert_eq!(ranked, vec![2, 1]);
        assert_eq!(ranker.rank("kafka", "DOC", 1).await.unwrap(), vec![2]);
        assert!(ranker.rank("", "DOC", 10).await.unwrap().is_empty());
        assert!(ranker.rank("kafka", "CODE", 10).await.unwrap().is_empty());
    }
}
