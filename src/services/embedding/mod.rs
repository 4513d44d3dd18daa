//! Text embedding: the provider seam and the core-side wrapper around it.

mod http;
mod onnx;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::EmbeddingError;
use crate::models::{EmbeddingConfig, EmbeddingDriver};

pub use http::HttpEmbeddingProvider;
pub use onnx::{EmbeddingModel, OnnxEmbeddingProvider};

/// Instruction type for embedding generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionType {
    /// For indexing documents
    Document,
    /// For search queries
    Query,
}

/// Something that turns text into fixed-length vectors.
///
/// Implementations may retry inside their transport. Callers should go
/// through [`Embedder`], which validates and normalizes whatever comes back.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a search query.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed document texts, one vector per input in the same order.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    async fn health_check(&self) -> Result<bool, EmbeddingError> {
        Ok(true)
    }
}

/// Build the provider selected by `config.driver`.
pub fn create_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match config.driver {
        EmbeddingDriver::Http => Ok(Arc::new(HttpEmbeddingProvider::new(config)?)),
        EmbeddingDriver::Onnx => Ok(Arc::new(OnnxEmbeddingProvider::load(config)?)),
    }
}

/// Batching, validation and normalization in front of an [`EmbeddingProvider`].
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub async fn health_check(&self) -> Result<bool, EmbeddingError> {
        self.provider.health_check().await
    }

    /// Unit-length vector for `text`. Blank text is rejected before any call.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }
        let vector = self.provider.embed_one(text).await?;
        self.check_dimension(&vector)?;
        Ok(l2_normalize(vector))
    }

    /// One unit-length vector per input, in input order. Blank inputs get a
    /// zero vector and are never sent to the provider.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let dimension = self.dimension();
        let mut vectors = vec![vec![0.0; dimension]; texts.len()];

        let pending: Vec<(usize, &String)> = texts
            .iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .collect();

        for batch in pending.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, text)| (*text).clone()).collect();
            let embedded = self.provider.embed_many(&inputs).await?;
            if embedded.len() != inputs.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    inputs.len(),
                    embedded.len()
                )));
            }

            for ((index, _), vector) in batch.iter().zip(embedded) {
                self.check_dimension(&vector)?;
                vectors[*index] = l2_normalize(vector);
            }
            debug!(batch = inputs.len(), "embedded batch");
        }

        Ok(vectors)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), EmbeddingError> {
        let expected = self.dimension();
        if vector.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Scale `v` to unit L2 norm. Zero vectors stay zero.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic provider: hashed character bigrams, deliberately not normalized.
    pub struct BigramProvider {
        pub dimension: usize,
        pub calls: AtomicUsize,
        pub seen_batch_sizes: std::sync::Mutex<Vec<usize>>,
    }

    impl BigramProvider {
        pub fn new(dimension: usize) -> Self {
            Self {
                dimension,
                calls: AtomicUsize::new(0),
                seen_batch_sizes: std::sync::Mutex::new(Vec::new()),
            }
        }

        pub fn vector(&self, text: &str) -> Vec<f32> {
            let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
            let mut v = vec![0.0; self.dimension];
            for pair in chars.windows(2) {
                let h = (pair[0] as u64).wrapping_mul(31).wrapping_add(pair[1] as u64);
                v[(h % self.dimension as u64) as usize] += 3.0;
            }
            v
        }
    }

    #[async_trait]
    impl EmbeddingProvider for BigramProvider {
        async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.vector(text))
        }

        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_batch_sizes.lock().unwrap().push(texts.len());
            Ok(texts.iter().map(|t| self.vector(t)).collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model_name(&self) -> &str {
            "bigram-test"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::BigramProvider;
    use super::*;
    use std::sync::atomic::Ordering;

    struct WrongDimension;

    #[async_trait]
    impl EmbeddingProvider for WrongDimension {
        async fn embed_one(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0; 3])
        }

        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![1.0; 3]).collect())
        }

        fn dimension(&self) -> usize {
            4
        }

        fn model_name(&self) -> &str {
            "broken"
        }
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_embed_one_rejects_blank_text() {
        let provider = Arc::new(BigramProvider::new(16));
        let embedder = Embedder::new(provider.clone(), 4);
        assert!(matches!(
            embedder.embed_one("   ").await,
            Err(EmbeddingError::EmptyText)
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_embed_one_is_normalized() {
        let embedder = Embedder::new(Arc::new(BigramProvider::new(16)), 4);
        let v = embedder.embed_one("班機延誤").await.unwrap();
        assert!((norm(&v) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_embed_many_batches_and_keeps_order() {
        let provider = Arc::new(BigramProvider::new(32));
        let embedder = Embedder::new(provider.clone(), 2);
        let texts: Vec<String> = ["旅程延誤", "", "行李遺失", "醫療費用", "  ", "緊急救援"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let vectors = embedder.embed_many(&texts).await.unwrap();
        assert_eq!(vectors.len(), texts.len());
        assert!(vectors[1].iter().all(|x| *x == 0.0));
        assert!(vectors[4].iter().all(|x| *x == 0.0));
        for i in [0, 2, 3, 5] {
            assert!((norm(&vectors[i]) - 1.0).abs() < 1e-5);
            assert_eq!(vectors[i], l2_normalize(provider.vector(&texts[i])));
        }
        assert_eq!(*provider.seen_batch_sizes.lock().unwrap(), vec![2, 2]);
    }

    #[tokio::test]
    async fn test_embed_many_all_blank_skips_provider() {
        let provider = Arc::new(BigramProvider::new(8));
        let embedder = Embedder::new(provider.clone(), 2);
        let vectors = embedder
            .embed_many(&["".to_string(), " ".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![0.0; 8], vec![0.0; 8]]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let embedder = Embedder::new(Arc::new(WrongDimension), 8);
        assert!(matches!(
            embedder.embed_one("保險").await,
            Err(EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
        assert!(matches!(
            embedder.embed_many(&["保險".to_string()]).await,
            Err(EmbeddingError::DimensionMismatch { .. })
        ));
    }
}
