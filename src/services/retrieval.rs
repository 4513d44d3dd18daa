//! Ingestion and query coordination.
//!
//! The orchestrator moves through `Uninitialized -> Indexing -> Ready`. A
//! failed or cancelled ingestion restores whichever state preceded it and the
//! error goes back to the caller; queries are only served once at least one
//! vector has been written (or found in the index by [`RetrievalOrchestrator::attach_existing`]).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EmbeddingError, RetrievalError, VectorStoreError};
use crate::models::{
    Chunk, ChunkArtifact, Config, DocumentMatch, ProcessingStats, RetrievalConfig, SearchResults,
    apply_threshold,
};
use crate::services::batch::embed_and_upsert;
use crate::services::chunker::ClauseChunker;
use crate::services::embedding::{Embedder, create_provider};
use crate::services::normalizer::TextNormalizer;
use crate::services::security::SecurityGate;
use crate::services::vector_store::{IndexStats, VectorIndex, create_backend};
use crate::utils::file::{list_documents, read_document_text, sanitize_filename};
use crate::utils::text::char_len;

/// Set to request that a running ingestion stop at the next batch boundary.
pub type CancelFlag = Arc<AtomicBool>;

/// Queries shorter than this many characters carry too little signal to embed.
pub const MIN_QUERY_CHARS: usize = 3;

const HEALTH_CHECK_TEXT: &str = "旅遊保險理賠";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Uninitialized,
    Indexing,
    Ready,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorState::Uninitialized => write!(f, "uninitialized"),
            OrchestratorState::Indexing => write!(f, "indexing"),
            OrchestratorState::Ready => write!(f, "ready"),
        }
    }
}

/// Snapshot returned by [`RetrievalOrchestrator::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub state: OrchestratorState,
    pub index: Option<IndexStats>,
    pub index_error: Option<String>,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub last_ingestion: Option<ProcessingStats>,
    pub last_error: Option<String>,
    pub audit_events: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub detail: String,
}

impl ComponentHealth {
    fn from_result<E: std::fmt::Display>(result: Result<String, E>) -> Self {
        match result {
            Ok(detail) => Self {
                healthy: true,
                detail,
            },
            Err(e) => Self {
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub state: OrchestratorState,
    pub embedding: ComponentHealth,
    pub index: ComponentHealth,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RetrievalError {
    let path = path.to_path_buf();
    move |source| RetrievalError::Io { path, source }
}

/// Trim `text` and check it is a usable query.
pub fn validate_query(text: &str, max_chars: usize) -> Result<&str, RetrievalError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RetrievalError::EmptyInput("query is blank".to_string()));
    }
    let length = char_len(trimmed);
    if length > max_chars {
        return Err(RetrievalError::InvalidQuery(format!(
            "query is {} characters, the limit is {}",
            length, max_chars
        )));
    }
    if length < MIN_QUERY_CHARS {
        return Err(RetrievalError::InvalidQuery(format!(
            "query must be at least {} characters",
            MIN_QUERY_CHARS
        )));
    }
    Ok(trimmed)
}

pub struct RetrievalOrchestrator {
    retrieval: RetrievalConfig,
    allowed_root: PathBuf,
    processed_dir: PathBuf,
    normalizer: TextNormalizer,
    security: SecurityGate,
    chunker: ClauseChunker,
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    state: OrchestratorState,
    cancel: CancelFlag,
    last_ingestion: Option<ProcessingStats>,
    last_error: Option<String>,
}

impl RetrievalOrchestrator {
    pub fn new(config: &Config, embedder: Embedder, index: Arc<dyn VectorIndex>) -> Self {
        let allowed_root = config
            .security
            .allowed_root
            .clone()
            .unwrap_or_else(|| config.data_dir.clone());

        Self {
            retrieval: config.retrieval.clone(),
            allowed_root,
            processed_dir: config.processed_dir(),
            normalizer: TextNormalizer::new(),
            security: SecurityGate::new(config.security.clone()),
            chunker: ClauseChunker::new(&config.retrieval),
            embedder,
            index,
            state: OrchestratorState::Uninitialized,
            cancel: Arc::new(AtomicBool::new(false)),
            last_ingestion: None,
            last_error: None,
        }
    }

    /// Build the embedding provider and index backend named in `config`.
    /// Connection problems surface here rather than on first use.
    pub async fn from_config(config: &Config) -> Result<Self, RetrievalError> {
        let provider = create_provider(&config.embedding)?;
        let embedder = Embedder::new(provider, config.embedding.batch_size);
        let index = create_backend(&config.vector_store, embedder.dimension()).await?;
        Ok(Self::new(config, embedder, index))
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == OrchestratorState::Ready
    }

    /// Shared flag; setting it cancels the running ingestion between batches.
    pub fn cancel_flag(&self) -> CancelFlag {
        Arc::clone(&self.cancel)
    }

    pub fn security(&self) -> &SecurityGate {
        &self.security
    }

    pub fn allowed_root(&self) -> &Path {
        &self.allowed_root
    }

    pub fn last_ingestion(&self) -> Option<&ProcessingStats> {
        self.last_ingestion.as_ref()
    }

    /// Ingest one document. Any failure aborts the call and is returned.
    pub async fn ingest(&mut self, source: &Path) -> Result<ProcessingStats, RetrievalError> {
        let previous = self.begin_ingestion();
        let started = Instant::now();
        let mut stats = ProcessingStats {
            total_documents: 1,
            ..Default::default()
        };

        let result = self.ingest_source(source, &mut stats).await;
        stats.processing_time = started.elapsed().as_secs_f64();
        match result {
            Ok(()) => Ok(self.finish_ingestion(previous, stats)),
            Err(e) => Err(self.fail_ingestion(previous, e)),
        }
    }

    /// Ingest every allow-listed file directly inside `dir`, in name order.
    /// Per-document failures are recorded in the returned stats and skipped.
    pub async fn ingest_directory(
        &mut self,
        dir: &Path,
    ) -> Result<ProcessingStats, RetrievalError> {
        let previous = self.begin_ingestion();
        let started = Instant::now();

        let documents = match list_documents(dir, &self.security.config().allowed_extensions) {
            Ok(documents) if documents.is_empty() => {
                let e = RetrievalError::EmptyInput(format!(
                    "no {} files in {}",
                    self.security.config().allowed_extensions.join("/"),
                    dir.display()
                ));
                return Err(self.fail_ingestion(previous, e));
            }
            Ok(documents) => documents,
            Err(source) => {
                let e = RetrievalError::Io {
                    path: dir.to_path_buf(),
                    source,
                };
                return Err(self.fail_ingestion(previous, e));
            }
        };

        let mut stats = ProcessingStats {
            total_documents: documents.len(),
            ..Default::default()
        };

        for document in &documents {
            match self.ingest_source(document, &mut stats).await {
                Ok(()) => {}
                Err(RetrievalError::Cancelled { written }) => {
                    let e = RetrievalError::Cancelled {
                        written: stats.vectors_written + written,
                    };
                    return Err(self.fail_ingestion(previous, e));
                }
                Err(RetrievalError::Security(e)) => {
                    warn!(source = %document.display(), kind = ?e.kind(), error = %e, "document rejected, continuing");
                    stats.record_failure(&document.display().to_string(), &e);
                }
                Err(e) => {
                    warn!(source = %document.display(), error = %e, "document failed, continuing");
                    stats.record_failure(&document.display().to_string(), &e);
                }
            }
        }

        stats.processing_time = started.elapsed().as_secs_f64();
        Ok(self.finish_ingestion(previous, stats))
    }

    /// Drop everything in the namespace, then ingest `source` (a file or directory).
    pub async fn reindex(&mut self, source: &Path) -> Result<ProcessingStats, RetrievalError> {
        info!(namespace = %self.index.namespace(), "clearing namespace for re-index");
        self.index.clear_namespace().await?;
        self.state = OrchestratorState::Uninitialized;
        self.last_ingestion = None;

        if source.is_dir() {
            self.ingest_directory(source).await
        } else {
            self.ingest(source).await
        }
    }

    /// Mark the system ready if the index already holds vectors for this namespace.
    pub async fn attach_existing(&mut self) -> Result<bool, RetrievalError> {
        let stats = self.index.stats().await?;
        if stats.namespace_vectors > 0 {
            self.state = OrchestratorState::Ready;
            debug!(vectors = stats.namespace_vectors, "attached to existing index");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn clear(&mut self) -> Result<(), RetrievalError> {
        self.index.clear_namespace().await?;
        self.state = OrchestratorState::Uninitialized;
        self.last_ingestion = None;
        info!(namespace = %self.index.namespace(), "namespace cleared");
        Ok(())
    }

    /// Ranked matches at or above the configured similarity threshold.
    pub async fn query(
        &self,
        text: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<DocumentMatch>, RetrievalError> {
        Ok(self.search(text, top_k, None).await?.matches)
    }

    /// Like [`query`](Self::query), with an optional threshold override and timing.
    pub async fn search(
        &self,
        text: &str,
        top_k: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<SearchResults, RetrievalError> {
        if !self.is_ready() {
            return Err(RetrievalError::NotInitialized);
        }
        let query = validate_query(text, self.retrieval.max_query_chars)?;
        let k = top_k.unwrap_or(self.retrieval.top_k);
        if k == 0 {
            return Err(RetrievalError::InvalidQuery(
                "top_k must be greater than 0".to_string(),
            ));
        }
        let threshold = threshold.unwrap_or(self.retrieval.similarity_threshold);

        let start = Instant::now();
        let vector = self.embedder.embed_one(query).await?;
        let candidates = self.index.search(&vector, k).await?;
        let candidate_count = candidates.len();
        let matches = apply_threshold(candidates, threshold);

        debug!(
            query = %query,
            candidates = candidate_count,
            kept = matches.len(),
            threshold,
            "search complete"
        );

        Ok(SearchResults::new(
            query.to_string(),
            matches,
            threshold,
            start.elapsed().as_millis() as u64,
        ))
    }

    pub async fn stats(&self) -> SystemStats {
        let (index, index_error) = match self.index.stats().await {
            Ok(stats) => (Some(stats), None),
            Err(e) => (None, Some(e.to_string())),
        };

        SystemStats {
            state: self.state,
            index,
            index_error,
            embedding_model: self.embedder.model_name().to_string(),
            embedding_dimension: self.embedder.dimension(),
            top_k: self.retrieval.top_k,
            similarity_threshold: self.retrieval.similarity_threshold,
            chunk_size: self.retrieval.chunk_size,
            chunk_overlap: self.retrieval.chunk_overlap,
            last_ingestion: self.last_ingestion.clone(),
            last_error: self.last_error.clone(),
            audit_events: self.security.audit_event_count(),
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        let embedding = ComponentHealth::from_result(self.check_embedding().await);
        let index = ComponentHealth::from_result(self.check_index().await);

        HealthReport {
            healthy: embedding.healthy && index.healthy,
            state: self.state,
            embedding,
            index,
        }
    }

    async fn check_embedding(&self) -> Result<String, EmbeddingError> {
        if !self.embedder.health_check().await? {
            return Err(EmbeddingError::ServerError(
                "health endpoint reported unhealthy".to_string(),
            ));
        }
        let vector = self.embedder.embed_one(HEALTH_CHECK_TEXT).await?;
        Ok(format!(
            "{} ({} dimensions)",
            self.embedder.model_name(),
            vector.len()
        ))
    }

    async fn check_index(&self) -> Result<String, VectorStoreError> {
        if !self.index.health_check().await? {
            return Err(VectorStoreError::ConnectionError(
                "backend reported unhealthy".to_string(),
            ));
        }
        let s = self.index.stats().await?;
        Ok(format!(
            "{} {} ({} vectors in namespace {})",
            s.backend, s.index_name, s.namespace_vectors, s.namespace
        ))
    }

    fn begin_ingestion(&mut self) -> OrchestratorState {
        let previous = self.state;
        self.state = OrchestratorState::Indexing;
        self.cancel.store(false, Ordering::SeqCst);
        previous
    }

    fn finish_ingestion(
        &mut self,
        previous: OrchestratorState,
        stats: ProcessingStats,
    ) -> ProcessingStats {
        self.state = if stats.vectors_written > 0 {
            OrchestratorState::Ready
        } else {
            previous
        };
        self.last_error = stats.errors.last().cloned();
        self.last_ingestion = Some(stats.clone());
        info!(
            documents = stats.total_documents,
            processed = stats.processed_documents,
            failed = stats.failed_documents,
            chunks = stats.total_chunks,
            vectors = stats.vectors_written,
            seconds = stats.processing_time,
            state = %self.state,
            "ingestion finished"
        );
        stats
    }

    fn fail_ingestion(&mut self, previous: OrchestratorState, error: RetrievalError) -> RetrievalError {
        self.state = previous;
        self.last_error = Some(error.to_string());
        warn!(error = %error, state = %self.state, "ingestion aborted");
        error
    }

    /// Security checks, cleaning, chunking, then embed and upsert in batches.
    async fn ingest_source(
        &mut self,
        source: &Path,
        stats: &mut ProcessingStats,
    ) -> Result<(), RetrievalError> {
        let path = self.security.validate_path(source, &self.allowed_root)?;
        self.security.validate_size_and_type(&path)?;

        let decoded = read_document_text(&path).map_err(|source| RetrievalError::Io {
            path: path.clone(),
            source,
        })?;
        if decoded.text.trim().is_empty() {
            return Err(RetrievalError::EmptyInput(format!(
                "{} contains no text",
                path.display()
            )));
        }
        debug!(source = %path.display(), encoding = decoded.encoding, "document decoded");

        let sanitized = self.security.sanitize(&decoded.text);
        let (masked, _) = self.security.detect_and_mask_pii(&sanitized);
        self.security.check_resource_limits(&masked)?;

        let cleaned = self.normalizer.clean(&masked);
        let source_id = path.display().to_string();
        let chunks = self
            .chunker
            .chunk(&cleaned, &source_id, self.retrieval.preserve_structure);
        if chunks.is_empty() {
            return Err(RetrievalError::EmptyInput(format!(
                "{} produced no chunks",
                path.display()
            )));
        }
        let lengths: Vec<usize> = chunks.iter().map(|c| c.metadata.chunk_length).collect();

        self.index.ensure_namespace(self.embedder.dimension()).await?;
        let keep: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();

        let batch_size = self.retrieval.upsert_batch_size.max(1);
        let mut remaining = chunks;
        let mut written: Vec<Chunk> = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(RetrievalError::Cancelled {
                    written: written.len(),
                });
            }
            let rest = remaining.split_off(batch_size.min(remaining.len()));
            let batch = std::mem::replace(&mut remaining, rest);
            let mut done = embed_and_upsert(&self.embedder, self.index.as_ref(), batch).await?;
            debug!(source = %source_id, batch = done.len(), "batch written");
            written.append(&mut done);
        }

        // Chunk ids are deterministic, so the new chunks have already replaced
        // their old versions. Only spans that no longer exist are removed.
        self.index.delete_source(&source_id, &keep).await?;

        if self.retrieval.persist_chunks {
            self.write_artifact(&path, &written)?;
        }

        stats.record_success(&lengths, written.len());
        info!(source = %source_id, chunks = written.len(), "document indexed");
        Ok(())
    }

    /// Write `<processed_dir>/<stem>_chunks.json` for auditing.
    fn write_artifact(&self, source: &Path, chunks: &[Chunk]) -> Result<PathBuf, RetrievalError> {
        let source_file = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = source
            .file_stem()
            .map(|s| sanitize_filename(&s.to_string_lossy()))
            .unwrap_or_else(|| "document".to_string());

        let artifact = ChunkArtifact::from_chunks(source_file, chunks);
        let json = serde_json::to_string_pretty(&artifact)?;

        std::fs::create_dir_all(&self.processed_dir).map_err(io_error(&self.processed_dir))?;
        let target = self.processed_dir.join(format!("{}_chunks.json", stem));
        std::fs::write(&target, json).map_err(io_error(&target))?;

        debug!(path = %target.display(), chunks = chunks.len(), "chunk artifact written");
        Ok(target)
    }
}
