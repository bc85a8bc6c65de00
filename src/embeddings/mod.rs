//! Embedding storage: chunk vectors keyed by (entity type, entity id, chunk index)

pub mod similarity;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use similarity::cosine_similarity;
pub use store::EmbeddingStore;

/// A stored chunk row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingChunk {
    pub entity_type: String,
    pub entity_id: i64,
    pub chunk_index: u32,
    pub text: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub token_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// One embedded chunk produced by a worker, before it is written
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEmbedding {
    pub chunk_index: u32,
    pub text: String,
    pub vector: Vec<f32>,
    pub token_count: u32,
}

/// Semantic search match
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChunkHit {
    pub entity_id: i64,
    pub chunk_index: u32,
    pub similarity: f64,
}
