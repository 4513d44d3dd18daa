mod config;
mod document;
mod response;
mod search;
mod stats;

pub use config::{
    COMPLETION_API_KEY_ENV, Config, DEFAULT_COLLECTION, DEFAULT_EMBEDDING_DIMENSION,
    DEFAULT_NAMESPACE, DEFAULT_QDRANT_URL, EMBEDDING_API_KEY_ENV, EmbeddingConfig,
    EmbeddingDriver, GenerationConfig, QDRANT_API_KEY_ENV, RetrievalConfig, SecurityConfig,
    VectorDriver, VectorStoreConfig,
};
pub use document::{ArtifactChunk, Chunk, ChunkArtifact, ChunkMetadata, ClauseType};
pub use response::{
    ChatMessage, ChatbotResponse, Completion, FinishReason, Role, SourceCitation, TokenUsage,
};
pub use search::{DocumentMatch, OutputFormat, SearchResults, apply_threshold, clamp_score};
pub use stats::ProcessingStats;

#[cfg(test)]
pub(crate) use document::sample_metadata;
