mod batch;
mod chunker;
mod completion;
mod embedding;
mod normalizer;
mod response;
mod retrieval;
mod security;
mod vector_store;

pub use batch::embed_and_upsert;
pub use chunker::{ChunkingOutcome, ChunkingStats, ClauseChunker, SizeDistribution, classify};
pub use completion::HttpCompletionProvider;
pub use embedding::{
    Embedder, EmbeddingModel, EmbeddingProvider, HttpEmbeddingProvider, InstructionType,
    OnnxEmbeddingProvider, create_provider, l2_normalize,
};
pub use normalizer::{CleaningStats, TextNormalizer};
pub use response::{
    CompletionProvider, NO_MATCH_ANSWER, NO_MATCH_CONFIDENCE, ResponseAssembler, build_context,
    build_messages, citations, compute_confidence,
};
pub use retrieval::{
    CancelFlag, ComponentHealth, HealthReport, MIN_QUERY_CHARS, OrchestratorState,
    RetrievalOrchestrator, SystemStats, validate_query,
};
pub use security::{AuditEvent, AuditEventKind, PiiKind, SecurityGate, Severity};
pub use vector_store::{
    InMemoryIndex, IndexStats, MAX_STORED_CONTENT_CHARS, PgVectorIndex, QdrantIndex, VectorIndex,
    create_backend,
};
