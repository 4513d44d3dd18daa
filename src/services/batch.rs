use crate::error::{RetrievalError, VectorStoreError};
use crate::models::Chunk;
use crate::services::embedding::Embedder;
use crate::services::vector_store::VectorIndex;

/// Embed one batch of chunks and upsert it. Returns the written chunks,
/// embeddings attached, in input order.
pub async fn embed_and_upsert(
    embedder: &Embedder,
    index: &dyn VectorIndex,
    batch: Vec<Chunk>,
) -> Result<Vec<Chunk>, RetrievalError> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = batch.iter().map(|c| c.content().to_string()).collect();
    let embeddings = embedder.embed_many(&texts).await?;

    let embedded: Vec<Chunk> = batch
        .into_iter()
        .zip(embeddings)
        .map(|(chunk, embedding)| chunk.with_embedding(embedding))
        .collect();

    let written = index.upsert(&embedded).await?;
    if written.len() != embedded.len() {
        return Err(RetrievalError::Index(VectorStoreError::UpsertError(format!(
            "index acknowledged {} of {} chunks",
            written.len(),
            embedded.len()
        ))));
    }
    Ok(embedded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClauseType, sample_metadata};
    use crate::services::embedding::testing::BigramProvider;
    use crate::services::vector_store::InMemoryIndex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_embed_and_upsert() {
        let embedder = Embedder::new(Arc::new(BigramProvider::new(16)), 8);
        let index = InMemoryIndex::new("travel", 16);
        let chunks = vec![
            Chunk::new("第1條 班機延誤", sample_metadata("1", ClauseType::Coverage)).unwrap(),
            Chunk::new("第2.1條 申請理賠", sample_metadata("2.1", ClauseType::Procedure)).unwrap(),
        ];
        let expected: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();

        let written = embed_and_upsert(&embedder, &index, chunks).await.unwrap();
        let ids: Vec<String> = written.iter().map(|c| c.chunk_id.clone()).collect();
        assert_eq!(ids, expected);
        assert!(written.iter().all(|c| c.embedding.as_ref().is_some_and(|e| e.len() == 16)));
        assert_eq!(index.stats().await.unwrap().namespace_vectors, 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let provider = Arc::new(BigramProvider::new(16));
        let embedder = Embedder::new(provider.clone(), 8);
        let index = InMemoryIndex::new("travel", 16);
        assert!(embed_and_upsert(&embedder, &index, Vec::new()).await.unwrap().is_empty());
        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
