//! Chunk sources: where workers read the text of an entity
//!
//! Chunking policy belongs to the source. The pipeline embeds whatever
//! chunks it is handed, in order.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::errors::{EmbedError, Result};

/// One piece of entity text to embed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub token_count: u32,
}

impl Chunk {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let token_count = estimate_tokens(&text);
        Self { text, token_count }
    }
}

/// Whitespace-delimited word count, used where no tokenizer is available
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Chunks of an entity in order; empty when the entity has no text
    async fn chunks(&self, entity_type: &str, entity_id: i64) -> Result<Vec<Chunk>>;
}

/// Entity text held in memory
#[derive(Debug, Default)]
pub struct InMemoryChunkSource {
    entries: RwLock<HashMap<(String, i64), Vec<Chunk>>>,
}

impl InMemoryChunkSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the chunks of an entity
    pub fn insert<I, S>(&self, entity_type: &str, entity_id: i64, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks = chunks.into_iter().map(Chunk::new).collect();
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((entity_type.to_string(), entity_id), chunks);
    }

    pub fn remove(&self, entity_type: &str, entity_id: i64) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(entity_type.to_string(), entity_id));
    }
}

#[async_trait]
impl ChunkSource for InMemoryChunkSource {
    async fn chunks(&self, entity_type: &str, entity_id: i64) -> Result<Vec<Chunk>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(entity_type.to_string(), entity_id))
            .cloned()
            .unwrap_or_default())
    }
}

/// Text files laid out as `<root>/<entity_type>/<entity_id>.txt`.
///
/// Blank-line separated paragraphs become chunks. A missing file yields no
/// chunks.
#[derive(Debug, Clone)]
pub struct FileChunkSource {
    root: PathBuf,
}

impl FileChunkSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, entity_type: &str, entity_id: i64) -> PathBuf {
        self.root
            .join(entity_type)
            .join(format!("{}.txt", entity_id))
    }
}

#[async_trait]
impl ChunkSource for FileChunkSource {
    async fn chunks(&self, entity_type: &str, entity_id: i64) -> Result<Vec<Chunk>> {
        if entity_type.is_empty()
            || entity_type.contains(['/', '\\'])
            || entity_type.starts_with('.')
        {
            return Err(EmbedError::InvalidContent(format!(
                "invalid entity type '{}'",
                entity_type
            )));
        }

        let path = self.path_for(entity_type, entity_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    target: "embedline.source",
                    path = %path.display(),
                    "no content file for entity"
                );
                return Ok(Vec::new());
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(EmbedError::InvalidContent(format!(
                    "{} is not valid UTF-8",
                    path.display()
                )))
            }
            Err(e) => {
                return Err(EmbedError::Source(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(split_paragraphs(&contents).into_iter().map(Chunk::new).collect())
    }
}

fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }
    paragraphs
}
