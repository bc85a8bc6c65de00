//! Reciprocal Rank Fusion of a keyword ranking and a semantic ranking
//!
//! For an entity at 1-based rank `r` in a list the contribution is
//! `1 / (k + r)`. An entity missing from a list contributes nothing for it.
//! With `alpha = Some(a)` the keyword contribution is scaled by `a` and the
//! semantic one by `1 - a`.
//!
//! Output order is fully deterministic:
//! 1. score descending
//! 2. best single-list rank ascending
//! 3. entity id ascending

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

pub const DEFAULT_RRF_K: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub k: f64,
    /// Keyword weight; `None` fuses unweighted
    pub alpha: Option<f64>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_RRF_K,
            alpha: None,
        }
    }
}

impl FusionConfig {
    fn weights(&self) -> (f64, f64) {
        match self.alpha {
            Some(alpha) if alpha.is_finite() => {
                let alpha = alpha.clamp(0.0, 1.0);
                (alpha, 1.0 - alpha)
            }
            _ => (1.0, 1.0),
        }
    }
}

/// One fused result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedEntity {
    pub entity_id: i64,
    pub score: f64,
    /// 1-based rank in the keyword list
    pub keyword_rank: Option<usize>,
    /// 1-based rank in the semantic list
    pub semantic_rank: Option<usize>,
}

impl FusedEntity {
    pub fn best_rank(&self) -> usize {
        match (self.keyword_rank, self.semantic_rank) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => usize::MAX,
        }
    }

    pub fn in_both(&self) -> bool {
        self.keyword_rank.is_some() && self.semantic_rank.is_some()
    }

    fn cmp_for_ranking(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.best_rank().cmp(&other.best_rank()))
            .then_with(|| self.entity_id.cmp(&other.entity_id))
    }
}

#[inline]
fn sanitize_k(k: f64) -> f64 {
    if k.is_finite() && k >= 0.0 {
        k
    } else {
        DEFAULT_RRF_K
    }
}

#[inline]
fn rank_contribution(k: f64, rank: usize) -> f64 {
    let rank = u32::try_from(rank).unwrap_or(u32::MAX);
    1.0 / (k + f64::from(rank))
}

/// Fuse two rankings (best first). Duplicate ids keep their first rank.
pub fn rrf_merge(keyword: &[i64], semantic: &[i64], config: &FusionConfig) -> Vec<FusedEntity> {
    let k = sanitize_k(config.k);
    let (keyword_weight, semantic_weight) = config.weights();
    let mut fused: HashMap<i64, FusedEntity> =
        HashMap::with_capacity(keyword.len() + semantic.len());

    for (index, &entity_id) in keyword.iter().enumerate() {
        let rank = index + 1;
        let entry = fused.entry(entity_id).or_insert_with(|| FusedEntity {
            entity_id,
            score: 0.0,
            keyword_rank: None,
            semantic_rank: None,
        });
        if entry.keyword_rank.is_none() {
            entry.keyword_rank = Some(rank);
            entry.score += keyword_weight * rank_contribution(k, rank);
        }
    }

    for (index, &entity_id) in semantic.iter().enumerate() {
        let rank = index + 1;
        let entry = fused.entry(entity_id).or_insert_with(|| FusedEntity {
            entity_id,
            score: 0.0,
            keyword_rank: None,
            semantic_rank: None,
        });
        if entry.semantic_rank.is_none() {
            entry.semantic_rank = Some(rank);
            entry.score += semantic_weight * rank_contribution(k, rank);
        }
    }

    let mut results: Vec<FusedEntity> = fused.into_values().collect();
    results.sort_by(FusedEntity::cmp_for_ranking);

    tracing::debug!(
        target: "embedline.search",
        keyword_count = keyword.len(),
        semantic_count = semantic.len(),
        fused_count = results.len(),
        overlap_count = results.iter().filter(|r| r.in_both()).count(),
        k,
        "rrf fusion complete"
    );

    results
}

/// RRF merger with fixed settings
#[derive(Debug, Clone, Default)]
pub struct HybridMerger {
    config: FusionConfig,
}

impl HybridMerger {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Fuse and keep the top `limit`
    pub fn merge(&self, keyword: &[i64], semantic: &[i64], limit: usize) -> Vec<FusedEntity> {
        let mut fused = rrf_merge(keyword, semantic, &self.config);
        fused.truncate(limit);
        fused
    }
}
