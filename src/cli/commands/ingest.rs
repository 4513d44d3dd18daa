use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Args;

use super::{open_orchestrator, spinner};
use crate::cli::output::get_formatter;
use crate::cli::shutdown_signal;
use crate::error::RetrievalError;
use crate::models::{Config, OutputFormat};

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(required = true, help = "Policy file, or a directory of policy files")]
    pub path: PathBuf,

    #[arg(long, help = "Delete the namespace before ingesting")]
    pub reindex: bool,

    #[arg(long, help = "Cut fixed-size windows instead of following clause structure")]
    pub flat: bool,

    #[arg(long, help = "Write <data_dir>/processed/<name>_chunks.json per document")]
    pub persist: bool,
}

pub async fn handle_ingest(
    args: IngestArgs,
    config: &Config,
    format: OutputFormat,
    verbose: bool,
) -> Result<()> {
    let mut config = config.clone();
    if args.flat {
        config.retrieval.preserve_structure = false;
    }
    if args.persist {
        config.retrieval.persist_chunks = true;
    }

    let formatter = get_formatter(format);
    let mut orchestrator = open_orchestrator(&config).await?;

    if verbose {
        eprintln!("Ingesting: {}", args.path.display());
        eprintln!("  Allowed root: {}", orchestrator.allowed_root().display());
        eprintln!(
            "  Chunking: {} chars, {} overlap, {}",
            config.retrieval.chunk_size,
            config.retrieval.chunk_overlap,
            if config.retrieval.preserve_structure {
                "clause-aware"
            } else {
                "flat"
            }
        );
    }

    // Interrupts stop the run at the next batch boundary instead of dropping it mid-write.
    let cancel = orchestrator.cancel_flag();
    let watcher = tokio::spawn(async move {
        shutdown_signal().await;
        eprintln!("\nReceived shutdown signal, stopping after the current batch...");
        cancel.store(true, Ordering::SeqCst);
    });

    let pb = spinner(format, format!("Indexing {}", args.path.display()));
    let result = if args.reindex {
        orchestrator.reindex(&args.path).await
    } else if args.path.is_dir() {
        orchestrator.ingest_directory(&args.path).await
    } else {
        orchestrator.ingest(&args.path).await
    };
    pb.finish_and_clear();
    watcher.abort();

    match result {
        Ok(stats) => {
            print!("{}", formatter.format_ingestion(&stats));
            if stats.processed_documents == 0 {
                anyhow::bail!("no documents were indexed");
            }
            Ok(())
        }
        Err(RetrievalError::Cancelled { written }) => {
            anyhow::bail!(
                "ingestion cancelled after {} vectors; run `policy-rag ingest --reindex` to rebuild",
                written
            )
        }
        Err(e) => Err(e).with_context(|| format!("failed to ingest {}", args.path.display())),
    }
}
