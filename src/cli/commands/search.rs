use anyhow::{Context, Result};
use clap::Args;

use super::{check_threshold, open_orchestrator, spinner};
use crate::cli::output::get_formatter;
use crate::error::RetrievalError;
use crate::models::{Config, OutputFormat};

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(required = true, help = "Search query text")]
    pub query: String,

    #[arg(long = "top-k", short = 'k', help = "Maximum number of clauses to return")]
    pub top_k: Option<usize>,

    #[arg(long, short = 't', help = "Minimum similarity score (0.0-1.0)")]
    pub threshold: Option<f32>,
}

pub async fn handle_search(
    args: SearchArgs,
    config: &Config,
    format: OutputFormat,
    verbose: bool,
) -> Result<()> {
    check_threshold(args.threshold)?;

    let formatter = get_formatter(format);
    let orchestrator = open_orchestrator(config).await?;

    if verbose {
        eprintln!("Query: \"{}\"", args.query.trim());
        eprintln!("  Top k: {}", args.top_k.unwrap_or(config.retrieval.top_k));
        eprintln!(
            "  Threshold: {:.2}",
            args.threshold.unwrap_or(config.retrieval.similarity_threshold)
        );
    }

    let pb = spinner(format, "Searching");
    let result = orchestrator
        .search(&args.query, args.top_k, args.threshold)
        .await;
    pb.finish_and_clear();

    let results = match result {
        Err(RetrievalError::NotInitialized) => {
            anyhow::bail!("nothing indexed yet; run `policy-rag ingest <path>` first")
        }
        other => other.context("search failed")?,
    };

    if verbose {
        eprintln!("Search took {}ms\n", results.duration_ms);
    }

    print!("{}", formatter.format_search_results(&results));
    Ok(())
}
