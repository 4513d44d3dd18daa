//! Process-local vector index using brute-force cosine similarity.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{IndexStats, VectorIndex, rank_matches, require_embedding, stored_content};
use crate::error::VectorStoreError;
use crate::models::{Chunk, DocumentMatch, VectorDriver};

/// Namespace name to (chunk id to chunk).
#[derive(Debug)]
pub struct InMemoryIndex {
    namespace: String,
    dimension: usize,
    namespaces: RwLock<HashMap<String, HashMap<String, Chunk>>>,
}

impl InMemoryIndex {
    pub fn new(namespace: &str, dimension: usize) -> Self {
        Self {
            namespace: namespace.to_string(),
            dimension,
            namespaces: RwLock::new(HashMap::new()),
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        Ok(true)
    }

    async fn ensure_namespace(&self, dimension: usize) -> Result<(), VectorStoreError> {
        if dimension != self.dimension {
            return Err(VectorStoreError::CollectionError(format!(
                "index dimension is {}, requested {}",
                self.dimension, dimension
            )));
        }
        self.namespaces
            .write()
            .await
            .entry(self.namespace.clone())
            .or_default();
        Ok(())
    }

    async fn upsert(&self, chunks: &[Chunk]) -> Result<Vec<String>, VectorStoreError> {
        // Validate the whole batch before touching the map.
        for chunk in chunks {
            let embedding = require_embedding(chunk)?;
            if embedding.len() != self.dimension {
                return Err(VectorStoreError::UpsertError(format!(
                    "chunk {} has dimension {}, index expects {}",
                    chunk.chunk_id,
                    embedding.len(),
                    self.dimension
                )));
            }
        }

        let mut namespaces = self.namespaces.write().await;
        let store = namespaces.entry(self.namespace.clone()).or_default();
        let mut written = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let mut stored = Chunk::new(stored_content(chunk), chunk.metadata.clone())
                .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;
            stored.embedding = chunk.embedding.clone();
            stored.created_at = chunk.created_at;
            store.insert(chunk.chunk_id.clone(), stored);
            written.push(chunk.chunk_id.clone());
        }
        Ok(written)
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<DocumentMatch>, VectorStoreError> {
        let namespaces = self.namespaces.read().await;
        let Some(store) = namespaces.get(&self.namespace) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(Chunk, f32)> = store
            .values()
            .map(|chunk| {
                let score = chunk
                    .embedding
                    .as_deref()
                    .map_or(0.0, |e| cosine_similarity(e, vector));
                let mut found = chunk.clone();
                found.embedding = None;
                (found, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        Ok(rank_matches(scored))
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, VectorStoreError> {
        let mut namespaces = self.namespaces.write().await;
        let Some(store) = namespaces.get_mut(&self.namespace) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| store.remove(*id).is_some()).count())
    }

    async fn delete_source(
        &self,
        source_path: &str,
        keep: &[String],
    ) -> Result<(), VectorStoreError> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let mut namespaces = self.namespaces.write().await;
        if let Some(store) = namespaces.get_mut(&self.namespace) {
            store.retain(|id, chunk| {
                chunk.metadata.source_path != source_path || keep.contains(id.as_str())
            });
        }
        Ok(())
    }

    async fn clear_namespace(&self) -> Result<(), VectorStoreError> {
        self.namespaces.write().await.remove(&self.namespace);
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats, VectorStoreError> {
        let namespaces = self.namespaces.read().await;
        let total_vectors = namespaces.values().map(|s| s.len() as u64).sum();
        let namespace_vectors = namespaces
            .get(&self.namespace)
            .map_or(0, |s| s.len() as u64);
        Ok(IndexStats {
            total_vectors,
            namespace_vectors,
            dimension: self.dimension,
            namespace: self.namespace.clone(),
            index_name: "memory".to_string(),
            backend: VectorDriver::Memory,
        })
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClauseType, sample_metadata};

    fn chunk(clause: &str, path: &str, embedding: Vec<f32>) -> Chunk {
        let mut metadata = sample_metadata(clause, ClauseType::Coverage);
        metadata.source_path = path.to_string();
        metadata.chunk_id = Chunk::generate_id(path, clause, 0, 10);
        Chunk::new(format!("第{}條 內容", clause), metadata)
            .unwrap()
            .with_embedding(embedding)
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_upsert_search_and_ranking() {
        let index = InMemoryIndex::new("travel", 2);
        index.ensure_namespace(2).await.unwrap();
        let written = index
            .upsert(&[
                chunk("1", "/a.txt", vec![1.0, 0.0]),
                chunk("2", "/a.txt", vec![0.6, 0.8]),
                chunk("3", "/a.txt", vec![-1.0, 0.0]),
            ])
            .await
            .unwrap();
        assert_eq!(written.len(), 3);

        let matches = index.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].document.metadata.clause_number, "1");
        assert_eq!(matches[0].rank, 1);
        assert_eq!(matches[1].document.metadata.clause_number, "2");
        assert!(matches.iter().all(|m| m.document.embedding.is_none()));
        assert!(matches.iter().all(|m| (0.0..=1.0).contains(&m.score)));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_chunk_id() {
        let index = InMemoryIndex::new("travel", 2);
        let c = chunk("1", "/a.txt", vec![1.0, 0.0]);
        index.upsert(std::slice::from_ref(&c)).await.unwrap();
        index.upsert(&[c]).await.unwrap();
        assert_eq!(index.stats().await.unwrap().namespace_vectors, 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_missing_or_wrong_embedding() {
        let index = InMemoryIndex::new("travel", 2);
        let bare = Chunk::new("第1條 內容", sample_metadata("1", ClauseType::General)).unwrap();
        assert!(index.upsert(&[bare]).await.is_err());
        assert!(
            index
                .upsert(&[chunk("1", "/a.txt", vec![1.0, 0.0, 0.0])])
                .await
                .is_err()
        );
        assert_eq!(index.stats().await.unwrap().namespace_vectors, 0);
    }

    #[tokio::test]
    async fn test_delete_and_delete_source() {
        let index = InMemoryIndex::new("travel", 2);
        let a = chunk("1", "/a.txt", vec![1.0, 0.0]);
        let b = chunk("2", "/b.txt", vec![0.0, 1.0]);
        let c = chunk("3", "/b.txt", vec![0.5, 0.5]);
        index.upsert(&[a.clone(), b, c]).await.unwrap();

        assert_eq!(index.delete(&[a.chunk_id.clone()]).await.unwrap(), 1);
        assert_eq!(index.delete(&[a.chunk_id]).await.unwrap(), 0);

        index.delete_source("/b.txt", &[]).await.unwrap();
        assert_eq!(index.stats().await.unwrap().namespace_vectors, 0);
    }

    #[tokio::test]
    async fn test_delete_source_keeps_listed_ids() {
        let index = InMemoryIndex::new("travel", 2);
        let a = chunk("1", "/a.txt", vec![1.0, 0.0]);
        let b = chunk("2", "/a.txt", vec![0.0, 1.0]);
        let other = chunk("1", "/b.txt", vec![0.5, 0.5]);
        index.upsert(&[a.clone(), b, other]).await.unwrap();

        index.delete_source("/a.txt", &[a.chunk_id.clone()]).await.unwrap();

        let matches = index.search(&[1.0, 0.0], 10).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().any(|m| m.document.chunk_id == a.chunk_id));
        assert!(
            matches
                .iter()
                .any(|m| m.document.metadata.source_path == "/b.txt")
        );
    }

    #[tokio::test]
    async fn test_health_check() {
        let index = InMemoryIndex::new("travel", 2);
        assert!(index.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_namespace() {
        let index = InMemoryIndex::new("travel", 2);
        index
            .upsert(&[chunk("1", "/a.txt", vec![1.0, 0.0])])
            .await
            .unwrap();
        index.clear_namespace().await.unwrap();

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.namespace_vectors, 0);
        assert_eq!(stats.backend, VectorDriver::Memory);
        assert!(index.search(&[1.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_namespace_checks_dimension() {
        let index = InMemoryIndex::new("travel", 4);
        assert!(index.ensure_namespace(8).await.is_err());
        assert!(index.ensure_namespace(4).await.is_ok());
    }
}
