//! Vector index abstraction.
//!
//! Every backend stores chunks of one namespace and answers cosine
//! nearest-neighbor queries over them. Threshold filtering is not done here;
//! backends return raw top-k matches and the orchestrator decides what to keep.

mod memory;
mod pgvector;
mod qdrant;

pub use memory::InMemoryIndex;
pub use pgvector::PgVectorIndex;
pub use qdrant::QdrantIndex;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VectorStoreError;
use crate::models::{Chunk, DocumentMatch, VectorDriver, VectorStoreConfig};
use crate::utils::text::{char_len, truncate_chars};

/// Content stored alongside each vector is capped at this many characters.
pub const MAX_STORED_CONTENT_CHARS: usize = 1000;

/// Index statistics reported by [`VectorIndex::stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_vectors: u64,
    pub namespace_vectors: u64,
    pub dimension: usize,
    pub namespace: String,
    pub index_name: String,
    pub backend: VectorDriver,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Cheap reachability check against the backend.
    async fn health_check(&self) -> Result<bool, VectorStoreError>;

    /// Create the backing collection/table for `dimension`-wide vectors if missing.
    async fn ensure_namespace(&self, dimension: usize) -> Result<(), VectorStoreError>;

    /// Insert or overwrite chunks by chunk id. Every chunk must carry an embedding.
    /// Returns the ids written, in input order.
    async fn upsert(&self, chunks: &[Chunk]) -> Result<Vec<String>, VectorStoreError>;

    /// Top `k` chunks of this namespace by descending cosine similarity.
    /// Returned documents carry no embedding.
    async fn search(&self, vector: &[f32], k: usize)
    -> Result<Vec<DocumentMatch>, VectorStoreError>;

    /// Delete chunks by id. Returns how many were removed where the backend can tell.
    async fn delete(&self, ids: &[String]) -> Result<usize, VectorStoreError>;

    /// Delete chunks that came from `source_path` unless their id is in `keep`.
    async fn delete_source(&self, source_path: &str, keep: &[String])
    -> Result<(), VectorStoreError>;

    async fn clear_namespace(&self) -> Result<(), VectorStoreError>;

    async fn stats(&self) -> Result<IndexStats, VectorStoreError>;

    fn namespace(&self) -> &str;
}

/// Build the backend selected by `config.driver`.
pub async fn create_backend(
    config: &VectorStoreConfig,
    dimension: usize,
) -> Result<Arc<dyn VectorIndex>, VectorStoreError> {
    match config.driver {
        VectorDriver::Memory => Ok(Arc::new(InMemoryIndex::new(&config.namespace, dimension))),
        VectorDriver::Qdrant => Ok(Arc::new(QdrantIndex::new(config, dimension)?)),
        VectorDriver::PostgreSQL => Ok(Arc::new(PgVectorIndex::new(config, dimension).await?)),
    }
}

/// Content as persisted next to the vector.
pub(crate) fn stored_content(chunk: &Chunk) -> String {
    let content = chunk.content();
    if char_len(content) > MAX_STORED_CONTENT_CHARS {
        truncate_chars(content, MAX_STORED_CONTENT_CHARS)
    } else {
        content.to_string()
    }
}

pub(crate) fn require_embedding(chunk: &Chunk) -> Result<&[f32], VectorStoreError> {
    chunk.embedding.as_deref().ok_or_else(|| {
        VectorStoreError::UpsertError(format!("chunk {} has no embedding", chunk.chunk_id))
    })
}

/// Turn `(chunk, score)` pairs into ranked matches, best first.
pub(crate) fn rank_matches(mut scored: Vec<(Chunk, f32)>) -> Vec<DocumentMatch> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
        .into_iter()
        .enumerate()
        .map(|(i, (chunk, score))| DocumentMatch::new(chunk, score, i as u32 + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClauseType, sample_metadata};

    #[test]
    fn test_stored_content_is_capped() {
        let long = "保".repeat(MAX_STORED_CONTENT_CHARS + 50);
        let chunk = Chunk::new(long, sample_metadata("1", ClauseType::General)).unwrap();
        assert_eq!(char_len(&stored_content(&chunk)), MAX_STORED_CONTENT_CHARS);

        let short = Chunk::new("第1條 短", sample_metadata("1", ClauseType::General)).unwrap();
        assert_eq!(stored_content(&short), "第1條 短");
    }

    #[test]
    fn test_require_embedding() {
        let chunk = Chunk::new("第1條 內容", sample_metadata("1", ClauseType::General)).unwrap();
        assert!(matches!(
            require_embedding(&chunk),
            Err(VectorStoreError::UpsertError(_))
        ));
        let chunk = chunk.with_embedding(vec![1.0, 0.0]);
        assert_eq!(require_embedding(&chunk).unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn test_rank_matches_orders_and_clamps() {
        let a = Chunk::new("第1條 甲", sample_metadata("1", ClauseType::General)).unwrap();
        let b = Chunk::new("第2條 乙", sample_metadata("2", ClauseType::Coverage)).unwrap();
        let matches = rank_matches(vec![(a, 0.4), (b, 1.2)]);
        assert_eq!(matches[0].document.metadata.clause_number, "2");
        assert_eq!(matches[0].score, 1.0);
        assert_eq!(matches[0].rank, 1);
        assert_eq!(matches[1].rank, 2);
    }
}
