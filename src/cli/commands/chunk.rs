use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::cli::output::{ChunkPreview, get_formatter};
use crate::models::{Config, OutputFormat};
use crate::services::{ChunkingStats, ClauseChunker, SecurityGate, TextNormalizer};
use crate::utils::file::read_document_text;

#[derive(Debug, Args)]
pub struct ChunkArgs {
    #[arg(required = true, help = "Policy file to chunk")]
    pub path: PathBuf,

    #[arg(long, help = "Cut fixed-size windows instead of following clause structure")]
    pub flat: bool,

    #[arg(long, short = 'n', default_value_t = 10, help = "Chunks to print")]
    pub limit: usize,
}

/// Run the cleaning and chunking stages offline. Nothing is embedded or indexed.
pub async fn handle_chunk(
    args: ChunkArgs,
    config: &Config,
    format: OutputFormat,
    _verbose: bool,
) -> Result<()> {
    let formatter = get_formatter(format);
    let mut gate = SecurityGate::new(config.security.clone());
    gate.validate_size_and_type(&args.path)?;

    let decoded = read_document_text(&args.path)
        .with_context(|| format!("failed to read {}", args.path.display()))?;
    let sanitized = gate.sanitize(&decoded.text);
    let (masked, _) = gate.detect_and_mask_pii(&sanitized);

    let normalizer = TextNormalizer::new();
    let cleaned = normalizer.clean(&masked);
    let cleaning = normalizer.stats(&masked, &cleaned);

    let chunker = ClauseChunker::new(&config.retrieval);
    let preserve_structure = config.retrieval.preserve_structure && !args.flat;
    let mut chunks = chunker.chunk(&cleaned, &args.path.display().to_string(), preserve_structure);
    let chunking = ChunkingStats::from_chunks(&chunks);
    chunks.truncate(args.limit);

    let preview = ChunkPreview {
        source: args.path.display().to_string(),
        cleaning,
        chunking,
        chunks,
    };
    print!("{}", formatter.format_chunk_preview(&preview));
    Ok(())
}
