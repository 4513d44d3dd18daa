//! Error types for the policy retrieval pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::utils::retry::Retryable;

/// Failures raised by the security gate. Each one aborts ingestion of the document.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("path traversal attempt: {0}")]
    PathTraversal(PathBuf),

    #[error("path {path} is outside allowed root {root}")]
    OutsideAllowedRoot { path: PathBuf, root: PathBuf },

    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(PathBuf),

    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("file is empty: {0}")]
    Empty(PathBuf),

    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("estimated memory {estimated} bytes exceeds limit of {limit} bytes")]
    EstimatedMemoryExceeded { estimated: u64, limit: u64 },

    #[error("repeated pattern detected: {0}")]
    RepeatedPatternAttack(String),
}

/// Coarse grouping of [`SecurityError`] used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityErrorKind {
    PathValidation,
    SizeOrType,
    ResourceLimit,
}

impl SecurityError {
    pub fn kind(&self) -> SecurityErrorKind {
        match self {
            SecurityError::PathTraversal(_)
            | SecurityError::OutsideAllowedRoot { .. }
            | SecurityError::UnsupportedExtension(_) => SecurityErrorKind::PathValidation,
            SecurityError::NotAFile(_)
            | SecurityError::Empty(_)
            | SecurityError::FileTooLarge { .. } => SecurityErrorKind::SizeOrType,
            SecurityError::EstimatedMemoryExceeded { .. }
            | SecurityError::RepeatedPatternAttack(_) => SecurityErrorKind::ResourceLimit,
        }
    }
}

/// Internal normalizer failure. Never escapes `TextNormalizer::clean`.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("cleaning dropped clause headers ({before} before, {after} after)")]
    ContentLost { before: usize, after: usize },
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk content must not be empty")]
    EmptyContent,
}

/// Errors from the local ONNX embedding model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to load model: {0}")]
    LoadError(String),

    #[error("tokenization failed: {0}")]
    TokenizerError(String),

    #[error("inference failed: {0}")]
    InferenceError(String),
}

/// Errors related to embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to connect to embedding server: {0}")]
    ConnectionError(String),

    #[error("embedding server error: {0}")]
    ServerError(String),

    #[error("embedding request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding timeout")]
    Timeout,

    #[error("cannot embed empty text")]
    EmptyText,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding model error: {0}")]
    Model(#[from] ModelError),
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::ConnectionError(_) | EmbeddingError::Timeout => true,
            EmbeddingError::ServerError(msg) => is_transient_status(msg),
            EmbeddingError::RequestError(e) => e.is_timeout() || e.is_connect(),
            EmbeddingError::InvalidResponse(_)
            | EmbeddingError::EmptyText
            | EmbeddingError::DimensionMismatch { .. }
            | EmbeddingError::Model(_) => false,
        }
    }
}

/// Errors related to vector index operations.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("failed to connect to vector store: {0}")]
    ConnectionError(String),

    #[error("collection error: {0}")]
    CollectionError(String),

    #[error("upsert error: {0}")]
    UpsertError(String),

    #[error("search error: {0}")]
    SearchError(String),

    #[error("delete error: {0}")]
    DeleteError(String),

    #[error("vector store client error: {0}")]
    ClientError(String),
}

/// Errors related to answer generation.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to connect to completion provider: {0}")]
    ConnectionError(String),

    #[error("completion provider error: {0}")]
    ServerError(String),

    #[error("completion request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid completion response: {0}")]
    InvalidResponse(String),

    #[error("completion provider is not configured: {0}")]
    NotConfigured(String),

    #[error("confidence {0} is outside [0, 1]")]
    InvalidConfidence(f32),

    #[error("response time {0} must not be negative")]
    InvalidResponseTime(f64),
}

impl Retryable for GenerationError {
    fn is_retryable(&self) -> bool {
        match self {
            GenerationError::ConnectionError(_) => true,
            GenerationError::ServerError(msg) => is_transient_status(msg),
            GenerationError::RequestError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

fn is_transient_status(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    ["429", "502", "503", "504"].iter().any(|code| msg.contains(code))
        || lower.contains("unavailable")
        || lower.contains("too many requests")
}

/// Errors surfaced by the retrieval orchestrator.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("system not ready: no documents have been indexed")]
    NotInitialized,

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("ingestion cancelled after {written} vectors were written")]
    Cancelled { written: usize },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("security check failed: {0}")]
    Security(#[from] SecurityError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index error: {0}")]
    Index(#[from] VectorStoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("path error: {0}")]
    PathError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_error_kinds() {
        assert_eq!(
            SecurityError::PathTraversal(PathBuf::from("../x.txt")).kind(),
            SecurityErrorKind::PathValidation
        );
        assert_eq!(
            SecurityError::FileTooLarge { size: 2, limit: 1 }.kind(),
            SecurityErrorKind::SizeOrType
        );
        assert_eq!(
            SecurityError::RepeatedPatternAttack("ab".into()).kind(),
            SecurityErrorKind::ResourceLimit
        );
    }

    #[test]
    fn test_embedding_error_retryable() {
        assert!(EmbeddingError::Timeout.is_retryable());
        assert!(EmbeddingError::ServerError("HTTP 503: overloaded".into()).is_retryable());
        assert!(!EmbeddingError::ServerError("HTTP 400: bad input".into()).is_retryable());
        assert!(!EmbeddingError::EmptyText.is_retryable());
    }

    #[test]
    fn test_generation_error_retryable() {
        assert!(GenerationError::ServerError("429 Too Many Requests".into()).is_retryable());
        assert!(!GenerationError::InvalidConfidence(1.5).is_retryable());
    }
}
