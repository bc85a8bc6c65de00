//! Hybrid retrieval: keyword and semantic rankings fused with RRF

pub mod engine;
pub mod fusion;
pub mod keyword;
pub mod semantic;

pub use engine::{HybridSearch, SearchHit};
pub use fusion::{rrf_merge, FusedEntity, FusionConfig, HybridMerger};
pub use keyword::{ChunkTextKeywordRanker, KeywordRanker};
pub use semantic::{SemanticMatch, SemanticRanker};
