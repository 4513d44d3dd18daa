use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::utils::retry::RetryConfig;

pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11411";
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1024;
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
pub const DEFAULT_COLLECTION: &str = "insurance-rag-index";
pub const DEFAULT_NAMESPACE: &str = "travel-insurance";
pub const DEFAULT_COMPLETION_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_COMPLETION_MODEL: &str = "gpt-4o-mini";

pub const EMBEDDING_API_KEY_ENV: &str = "POLICY_RAG_EMBEDDING_API_KEY";
pub const COMPLETION_API_KEY_ENV: &str = "POLICY_RAG_COMPLETION_API_KEY";
pub const QDRANT_API_KEY_ENV: &str = "POLICY_RAG_QDRANT_API_KEY";

/// Whole-application settings, built once at startup and handed to each component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    /// Root for uploads and persisted chunk artifacts.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            retrieval: RetrievalConfig::default(),
            security: SecurityConfig::default(),
            generation: GenerationConfig::default(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("policy-rag").join("config.toml"))
    }

    /// Load from `path` (or the default location), then apply environment overrides.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(Self::config_path);
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)?;
                toml::from_str(&content)?
            }
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(Self::config_path)
            .ok_or_else(|| {
                ConfigError::PathError("could not determine config directory".to_string())
            })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Secrets come from the environment (and `.env`) rather than the config file.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(EMBEDDING_API_KEY_ENV) {
            self.embedding.api_key = Some(key);
        }
        if let Ok(key) = std::env::var(COMPLETION_API_KEY_ENV) {
            self.generation.api_key = Some(key);
        }
        if let Ok(key) = std::env::var(QDRANT_API_KEY_ENV) {
            self.vector_store.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let retrieval = &self.retrieval;
        if retrieval.chunk_size == 0 {
            return invalid("retrieval.chunk_size must be greater than 0");
        }
        if retrieval.chunk_overlap >= retrieval.chunk_size {
            return invalid(format!(
                "retrieval.chunk_overlap ({}) must be smaller than retrieval.chunk_size ({})",
                retrieval.chunk_overlap, retrieval.chunk_size
            ));
        }
        if !(0.0..=1.0).contains(&retrieval.similarity_threshold) {
            return invalid("retrieval.similarity_threshold must be within [0, 1]");
        }
        if retrieval.top_k == 0 {
            return invalid("retrieval.top_k must be greater than 0");
        }
        if retrieval.upsert_batch_size == 0 || self.embedding.batch_size == 0 {
            return invalid("batch sizes must be greater than 0");
        }
        if self.embedding.dimension == 0 {
            return invalid("embedding.dimension must be greater than 0");
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return invalid("generation.temperature must be within [0, 2]");
        }
        if self.security.allowed_extensions.is_empty() {
            return invalid("security.allowed_extensions must not be empty");
        }
        Ok(())
    }

    /// Directory for persisted chunk artifacts.
    pub fn processed_dir(&self) -> PathBuf {
        self.data_dir.join("processed")
    }
}

fn invalid(message: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::ValidationError(message.into()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingDriver {
    /// Remote embedding server speaking `POST /embed`.
    #[default]
    Http,
    /// Local ONNX model loaded in-process.
    Onnx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub driver: EmbeddingDriver,

    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Directory holding `model.onnx` and `tokenizer.json` for the ONNX driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,

    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_embedding_url() -> String {
    DEFAULT_EMBEDDING_URL.to_string()
}

fn default_embedding_model() -> String {
    "Qwen/Qwen3-Embedding-0.6B".to_string()
}

fn default_embedding_dimension() -> usize {
    DEFAULT_EMBEDDING_DIMENSION
}

fn default_max_tokens() -> usize {
    512
}

fn default_timeout() -> u64 {
    120
}

fn default_embedding_batch_size() -> usize {
    32
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            driver: EmbeddingDriver::default(),
            url: default_embedding_url(),
            api_key: None,
            model: default_embedding_model(),
            model_dir: None,
            dimension: default_embedding_dimension(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout(),
            batch_size: default_embedding_batch_size(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorDriver {
    /// Process-local index; contents vanish on exit.
    Memory,
    #[default]
    Qdrant,
    #[serde(alias = "postgres", alias = "pgvector")]
    PostgreSQL,
}

impl std::fmt::Display for VectorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorDriver::Memory => write!(f, "memory"),
            VectorDriver::Qdrant => write!(f, "qdrant"),
            VectorDriver::PostgreSQL => write!(f, "postgresql"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub driver: VectorDriver,

    /// Qdrant gRPC URL or PostgreSQL connection string.
    #[serde(default = "default_qdrant_url")]
    pub url: String,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

fn default_qdrant_url() -> String {
    DEFAULT_QDRANT_URL.to_string()
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_pool_size() -> u32 {
    5
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            driver: VectorDriver::default(),
            url: default_qdrant_url(),
            collection: default_collection(),
            namespace: default_namespace(),
            api_key: None,
            max_connections: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Clause-aware chunking; `false` cuts fixed-size windows only.
    #[serde(default = "default_true")]
    pub preserve_structure: bool,

    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,

    /// Write `<data_dir>/processed/<stem>_chunks.json` after each ingestion.
    #[serde(default)]
    pub persist_chunks: bool,

    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

fn default_top_k() -> usize {
    5
}

fn default_similarity_threshold() -> f32 {
    0.8
}

fn default_chunk_size() -> usize {
    256
}

fn default_chunk_overlap() -> usize {
    26
}

fn default_true() -> bool {
    true
}

fn default_upsert_batch_size() -> usize {
    100
}

fn default_max_query_chars() -> usize {
    1000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            preserve_structure: true,
            upsert_batch_size: default_upsert_batch_size(),
            persist_chunks: false,
            max_query_chars: default_max_query_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    #[serde(default = "default_true")]
    pub enable_pii_masking: bool,

    #[serde(default = "default_max_memory")]
    pub max_memory_bytes: u64,

    /// Worst-case processing memory per input byte.
    #[serde(default = "default_memory_multiplier")]
    pub memory_multiplier: u64,

    /// Documents must live under this directory. Defaults to `data_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_root: Option<PathBuf>,
}

fn default_max_file_size() -> u64 {
    10_000_000
}

fn default_allowed_extensions() -> Vec<String> {
    vec![".txt".to_string()]
}

fn default_max_memory() -> u64 {
    500_000_000
}

fn default_memory_multiplier() -> u64 {
    5
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
            enable_pii_masking: true,
            max_memory_bytes: default_max_memory(),
            memory_multiplier: default_memory_multiplier(),
            allowed_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_completion_url")]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_completion_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_completion_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Conversation turns forwarded to the provider.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_completion_url() -> String {
    DEFAULT_COMPLETION_URL.to_string()
}

fn default_completion_model() -> String {
    DEFAULT_COMPLETION_MODEL.to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_completion_tokens() -> u32 {
    1000
}

fn default_history_window() -> usize {
    6
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: default_completion_url(),
            api_key: None,
            model: default_completion_model(),
            temperature: default_temperature(),
            max_tokens: default_completion_tokens(),
            timeout_secs: default_timeout(),
            history_window: default_history_window(),
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.embedding.url, DEFAULT_EMBEDDING_URL);
        assert_eq!(config.vector_store.collection, DEFAULT_COLLECTION);
        assert_eq!(config.vector_store.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.similarity_threshold, 0.8);
        assert_eq!(config.retrieval.chunk_size, 256);
        assert_eq!(config.retrieval.chunk_overlap, 26);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.security.max_file_size, 10_000_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.is_some());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retrieval]
            top_k = 3

            [vector_store]
            driver = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.retrieval.chunk_size, 256);
        assert_eq!(config.vector_store.driver, VectorDriver::Memory);
        assert_eq!(config.embedding.driver, EmbeddingDriver::Http);
    }

    #[test]
    fn test_validate_rejects_overlap_not_smaller_than_size() {
        let mut config = Config::default();
        config.retrieval.chunk_overlap = config.retrieval.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut config = Config::default();
        config.retrieval.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.retrieval.top_k = 7;
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.retrieval.top_k, 7);
    }
}
