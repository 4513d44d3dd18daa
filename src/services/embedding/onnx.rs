//! In-process embedding with a local ONNX model.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tokenizers::{PaddingParams, PaddingStrategy, TruncationParams, TruncationStrategy};
use tracing::info;

use super::{EmbeddingProvider, l2_normalize};
use crate::error::{EmbeddingError, ModelError};
use crate::models::EmbeddingConfig;

const QUERY_INSTRUCTION: &str =
    "Instruct: Given a question about an insurance policy, retrieve the relevant policy clauses\nQuery: ";

pub struct EmbeddingModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimension: usize,
}

impl EmbeddingModel {
    /// Load `model.onnx` and `tokenizer.json` from `model_dir`.
    pub fn load(config: &EmbeddingConfig, model_dir: &Path) -> Result<Self, ModelError> {
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() {
            return Err(ModelError::NotFound(model_path));
        }

        let session = Session::builder()
            .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?
            .with_intra_threads(num_cpus())
            .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?
            .commit_from_file(&model_path)
            .map_err(|e: ort::Error| ModelError::LoadError(e.to_string()))?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_tokens,
                strategy: TruncationStrategy::LongestFirst,
                ..Default::default()
            }))
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        info!(model = %model_path.display(), dimension = config.dimension, "loaded ONNX embedding model");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimension: config.dimension,
        })
    }

    /// Embed `texts` synchronously. Queries get the retrieval instruction prefix.
    pub fn embed(&self, texts: &[String], is_query: bool) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let inputs: Vec<String> = if is_query {
            texts
                .iter()
                .map(|t| format!("{}{}", QUERY_INSTRUCTION, t))
                .collect()
        } else {
            texts.to_vec()
        };

        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);
        let batch_size = encodings.len();

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        let mut position_ids = vec![0i64; batch_size * max_len];
        // Last non-padding token per row, used for pooling.
        let mut last_token = vec![0usize; batch_size];

        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            for (j, (&id, &m)) in ids.iter().zip(mask.iter()).enumerate() {
                input_ids[i * max_len + j] = id as i64;
                attention_mask[i * max_len + j] = m as i64;
                position_ids[i * max_len + j] = j as i64;
                if m == 1 {
                    last_token[i] = j;
                }
            }
        }

        let input_ids_tensor = Tensor::from_array(([batch_size, max_len], input_ids))
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;
        let attention_mask_tensor = Tensor::from_array(([batch_size, max_len], attention_mask))
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;
        let position_ids_tensor = Tensor::from_array(([batch_size, max_len], position_ids))
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::InferenceError("session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![
                input_ids_tensor,
                attention_mask_tensor,
                position_ids_tensor
            ])
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;

        let output: ndarray::ArrayViewD<'_, f32> = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e: ort::Error| ModelError::InferenceError(e.to_string()))?;

        let shape = output.shape().to_vec();
        let hidden = *shape.last().unwrap_or(&0);
        if hidden < self.dimension {
            return Err(ModelError::InferenceError(format!(
                "model output width {} is smaller than configured dimension {}",
                hidden, self.dimension
            )));
        }

        let embeddings = match shape.len() {
            3 => (0..batch_size)
                .map(|i| {
                    let row: Vec<f32> = (0..self.dimension)
                        .map(|d| output[[i, last_token[i], d]])
                        .collect();
                    l2_normalize(row)
                })
                .collect(),
            2 => (0..batch_size)
                .map(|i| l2_normalize((0..self.dimension).map(|d| output[[i, d]]).collect()))
                .collect(),
            _ => {
                return Err(ModelError::InferenceError(format!(
                    "unexpected output shape: {:?}",
                    shape
                )));
            }
        };

        Ok(embeddings)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// [`EmbeddingProvider`] backed by an [`EmbeddingModel`] on the blocking pool.
pub struct OnnxEmbeddingProvider {
    model: Arc<EmbeddingModel>,
    name: String,
}

impl OnnxEmbeddingProvider {
    pub fn load(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let model_dir = config.model_dir.as_deref().ok_or_else(|| {
            ModelError::LoadError("embedding.model_dir is required for the onnx driver".to_string())
        })?;
        let model = EmbeddingModel::load(config, model_dir)?;
        Ok(Self {
            model: Arc::new(model),
            name: config.model.clone(),
        })
    }

    async fn run(&self, texts: Vec<String>, is_query: bool) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = Arc::clone(&self.model);
        let result = tokio::task::spawn_blocking(move || model.embed(&texts, is_query))
            .await
            .map_err(|e| ModelError::InferenceError(format!("embedding task failed: {}", e)))?;
        Ok(result?)
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxEmbeddingProvider {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.run(vec![text.to_string()], true)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("model returned no embedding".to_string()))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.run(texts.to_vec(), false).await
    }

    fn dimension(&self) -> usize {
        self.model.dimension()
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_requires_model_dir() {
        let config = EmbeddingConfig::default();
        assert!(matches!(
            OnnxEmbeddingProvider::load(&config),
            Err(EmbeddingError::Model(ModelError::LoadError(_)))
        ));
    }

    #[test]
    fn test_load_reports_missing_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            model_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            OnnxEmbeddingProvider::load(&config),
            Err(EmbeddingError::Model(ModelError::NotFound(_)))
        ));
    }
}
