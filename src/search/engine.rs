//! Hybrid search: keyword ranking + semantic ranking fused with RRF
//!
//! When the semantic side is disabled or fails (breaker open, provider
//! down, store error) the query is answered from the keyword ranking alone.

use serde::Serialize;
use std::sync::Arc;

use crate::errors::Result;
use crate::search::fusion::HybridMerger;
use crate::search::keyword::KeywordRanker;
use crate::search::semantic::SemanticRanker;

/// Candidates fetched from each ranker per requested result
const CANDIDATE_MULTIPLIER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub entity_id: i64,
    pub score: f64,
}

pub struct HybridSearch {
    keyword: Arc<dyn KeywordRanker>,
    semantic: Option<SemanticRanker>,
    merger: HybridMerger,
}

impl HybridSearch {
    pub fn new(
        keyword: Arc<dyn KeywordRanker>,
        semantic: Option<SemanticRanker>,
        merger: HybridMerger,
    ) -> Self {
        Self {
            keyword,
            semantic,
            merger,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        entity_type: &str,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let candidates = limit.saturating_mul(CANDIDATE_MULTIPLIER);
        let keyword = self.keyword.rank(query, entity_type, candidates).await?;

        let semantic = match &self.semantic {
            Some(ranker) => match ranker
                .rank(query, entity_type, min_similarity, candidates)
                .await
            {
                Ok(matches) => matches.into_iter().map(|m| m.entity_id).collect(),
                Err(e) => {
                    tracing::warn!(
                        target: "embedline.search",
                        entity_type,
                        error = %e,
                        "semantic ranking unavailable; using keyword ranking only"
                    );
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let hits: Vec<SearchHit> = self
            .merger
            .merge(&keyword, &semantic, limit)
            .into_iter()
            .map(|fused| SearchHit {
                entity_id: fused.entity_id,
                score: fused.score,
            })
            .collect();

        tracing::debug!(
            target: "embedline.search",
            entity_type,
            keyword_count = keyword.len(),
            semantic_count = semantic.len(),
            results = hits.len(),
            "hybrid search completed"
        );
        Ok(hits)
    }
}
