//! Per-chunk embedding persistence and brute-force nearest-neighbour search

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use crate::embeddings::similarity::{cosine_similarity, decode_vector, encode_vector};
use crate::embeddings::{ChunkEmbedding, ChunkHit, EmbeddingChunk};
use crate::errors::Result;
use crate::storage::{from_millis, to_millis, Database};

const UPSERT_SQL: &str = "INSERT INTO embedding_chunks \
     (entity_type, entity_id, chunk_index, text, vector, dimensions, model, token_count, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
     ON CONFLICT (entity_type, entity_id, chunk_index) DO UPDATE SET \
         text = excluded.text, \
         vector = excluded.vector, \
         dimensions = excluded.dimensions, \
         model = excluded.model, \
         token_count = excluded.token_count, \
         updated_at = excluded.updated_at";

/// Repository for `embedding_chunks`
pub struct EmbeddingStore {
    db: Arc<Database>,
}

impl EmbeddingStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace one chunk by `(entity_type, entity_id, chunk_index)`
    pub fn upsert(
        &self,
        entity_type: &str,
        entity_id: i64,
        chunk: &ChunkEmbedding,
        model: &str,
    ) -> Result<()> {
        let now_ms = to_millis(Utc::now());
        self.db
            .with_conn(|conn| upsert_in(conn, entity_type, entity_id, chunk, model, now_ms))
    }

    /// Chunks of `entity_type` at or above `min_similarity`, best first
    pub fn semantic_search(
        &self,
        entity_type: &str,
        query: &[f32],
        min_similarity: f64,
        limit: usize,
    ) -> Result<Vec<ChunkHit>> {
        if limit == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        self.scan(entity_type, query, min_similarity, |hit| hits.push(hit))?;
        hits.sort_by(rank_order);
        hits.truncate(limit);

        tracing::debug!(
            target: "embedline.embeddings",
            op = "embeddings.semantic_search",
            entity_type,
            dimensions = query.len(),
            min_similarity,
            hits = hits.len(),
            "semantic search completed"
        );
        Ok(hits)
    }

    /// Best chunk of each entity at or above `min_similarity`, best first.
    ///
    /// `limit` counts entities: an entity with many matching chunks takes a
    /// single slot.
    pub fn semantic_search_entities(
        &self,
        entity_type: &str,
        query: &[f32],
        min_similarity: f64,
        limit: usize,
    ) -> Result<Vec<ChunkHit>> {
        if limit == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let mut best: HashMap<i64, ChunkHit> = HashMap::new();
        self.scan(entity_type, query, min_similarity, |hit| {
            match best.entry(hit.entity_id) {
                Entry::Occupied(mut current) => {
                    if rank_order(&hit, current.get()) == Ordering::Less {
                        current.insert(hit);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(hit);
                }
            }
        })?;

        let mut hits: Vec<ChunkHit> = best.into_values().collect();
        hits.sort_by(rank_order);
        hits.truncate(limit);

        tracing::debug!(
            target: "embedline.embeddings",
            op = "embeddings.semantic_search_entities",
            entity_type,
            dimensions = query.len(),
            min_similarity,
            hits = hits.len(),
            "semantic entity search completed"
        );
        Ok(hits)
    }

    /// Feed every chunk of `entity_type` with the query's dimension and a
    /// similarity of at least `min_similarity` to `visit`
    fn scan<F>(&self, entity_type: &str, query: &[f32], min_similarity: f64, mut visit: F) -> Result<()>
    where
        F: FnMut(ChunkHit),
    {
        let dimensions = i64::try_from(query.len()).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entity_id, chunk_index, vector FROM embedding_chunks \
                 WHERE entity_type = ?1 AND dimensions = ?2",
            )?;
            let rows = stmt.query_map(params![entity_type, dimensions], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;

            for row in rows {
                let (entity_id, chunk_index, blob) = row?;
                let Some(vector) = decode_vector(&blob) else {
                    tracing::warn!(
                        target: "embedline.embeddings",
                        entity_type,
                        entity_id,
                        chunk_index,
                        "skipping chunk with malformed vector blob"
                    );
                    continue;
                };
                if let Some(similarity) = cosine_similarity(query, &vector) {
                    if similarity >= min_similarity {
                        visit(ChunkHit {
                            entity_id,
                            chunk_index,
                            similarity,
                        });
                    }
                }
            }
            Ok(())
        })
    }

    /// Remove every chunk row of an entity
    pub fn delete_entity(&self, entity_type: &str, entity_id: i64) -> Result<usize> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM embedding_chunks WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type, entity_id],
            )?)
        })?;

        tracing::info!(
            target: "embedline.embeddings",
            entity_type,
            entity_id,
            deleted,
            "deleted entity embeddings"
        );
        Ok(deleted)
    }

    /// Stored chunks of one entity in chunk order
    pub fn chunks_for(&self, entity_type: &str, entity_id: i64) -> Result<Vec<EmbeddingChunk>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, entity_id, chunk_index, text, vector, model, token_count, updated_at \
                 FROM embedding_chunks WHERE entity_type = ?1 AND entity_id = ?2 \
                 ORDER BY chunk_index ASC",
            )?;
            let rows = stmt.query_map(params![entity_type, entity_id], chunk_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn count_chunks(&self, entity_type: Option<&str>) -> Result<u64> {
        let count: i64 = self.db.with_conn(|conn| {
            Ok(match entity_type {
                Some(entity_type) => conn.query_row(
                    "SELECT COUNT(*) FROM embedding_chunks WHERE entity_type = ?1",
                    params![entity_type],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM embedding_chunks", [], |row| {
                    row.get(0)
                })?,
            })
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// `(entity_id, text)` for every stored chunk of a type, in entity order
    pub fn texts_for_type(&self, entity_type: &str) -> Result<Vec<(i64, String)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entity_id, text FROM embedding_chunks WHERE entity_type = ?1 \
                 ORDER BY entity_id ASC, chunk_index ASC",
            )?;
            let rows = stmt.query_map(params![entity_type], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

/// Similarity descending, then entity id and chunk index ascending
fn rank_order(a: &ChunkHit, b: &ChunkHit) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.entity_id.cmp(&b.entity_id))
        .then_with(|| a.chunk_index.cmp(&b.chunk_index))
}

pub(crate) fn upsert_in(
    conn: &Connection,
    entity_type: &str,
    entity_id: i64,
    chunk: &ChunkEmbedding,
    model: &str,
    now_ms: i64,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(UPSERT_SQL)?;
    stmt.execute(params![
        entity_type,
        entity_id,
        chunk.chunk_index,
        chunk.text,
        encode_vector(&chunk.vector),
        i64::try_from(chunk.vector.len()).unwrap_or(i64::MAX),
        model,
        chunk.token_count,
        now_ms
    ])?;
    Ok(())
}

/// Make `chunks` the complete chunk set of the entity: upsert each one and
/// drop rows at indexes the new set no longer covers. Runs on the caller's
/// connection so it joins the caller's transaction.
pub(crate) fn replace_entity_chunks(
    conn: &Connection,
    entity_type: &str,
    entity_id: i64,
    chunks: &[ChunkEmbedding],
    model: &str,
    now_ms: i64,
) -> Result<()> {
    for chunk in chunks {
        upsert_in(conn, entity_type, entity_id, chunk, model, now_ms)?;
    }

    let keep = chunks
        .iter()
        .map(|chunk| chunk.chunk_index)
        .collect::<Vec<_>>();
    let mut stmt = conn.prepare_cached(
        "SELECT chunk_index FROM embedding_chunks WHERE entity_type = ?1 AND entity_id = ?2",
    )?;
    let existing = stmt
        .query_map(params![entity_type, entity_id], |row| row.get::<_, u32>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for stale in existing.into_iter().filter(|index| !keep.contains(index)) {
        conn.execute(
            "DELETE FROM embedding_chunks \
             WHERE entity_type = ?1 AND entity_id = ?2 AND chunk_index = ?3",
            params![entity_type, entity_id, stale],
        )?;
    }
    Ok(())
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<EmbeddingChunk> {
    let blob: Vec<u8> = row.get(4)?;
    let vector = decode_vector(&blob).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(4, "vector".to_string(), rusqlite::types::Type::Blob)
    })?;
    Ok(EmbeddingChunk {
        entity_type: row.get(0)?,
        entity_id: row.get(1)?,
        chunk_index: row.get(2)?,
        text: row.get(3)?,
        vector,
        model: row.get(5)?,
        token_count: row.get(6)?,
        updated_at: from_millis(row.get(7)?),
    })
}
