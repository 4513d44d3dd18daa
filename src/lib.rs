//! Clause-aware retrieval-augmented question answering over insurance policy documents.
//!
//! Documents pass through [`services::SecurityGate`], [`services::TextNormalizer`] and
//! [`services::ClauseChunker`], are embedded by an [`services::EmbeddingProvider`] and stored in a
//! [`services::VectorIndex`]. [`services::RetrievalOrchestrator`] drives that pipeline and serves
//! queries; [`services::ResponseAssembler`] turns matches into a cited, scored answer.

pub mod cli;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use cli::{Cli, Commands};
pub use error::RetrievalError;
pub use models::{Config, OutputFormat};
