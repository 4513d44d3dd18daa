use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;

use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};
use crate::services::RetrievalOrchestrator;

#[derive(Debug, Args)]
pub struct ClearArgs {
    #[arg(long, short = 'y', help = "Skip the confirmation prompt")]
    pub yes: bool,
}

pub async fn handle_clear(
    args: ClearArgs,
    config: &Config,
    format: OutputFormat,
    _verbose: bool,
) -> Result<()> {
    let formatter = get_formatter(format);
    let namespace = &config.vector_store.namespace;

    if !args.yes && !confirm(namespace)? {
        println!("{}", formatter.format_message("Aborted."));
        return Ok(());
    }

    let mut orchestrator = RetrievalOrchestrator::from_config(config)
        .await
        .context("failed to initialize retrieval pipeline")?;
    orchestrator
        .clear()
        .await
        .with_context(|| format!("failed to clear namespace {}", namespace))?;

    println!(
        "{}",
        formatter.format_message(&format!(
            "Cleared namespace '{}' in {}",
            namespace, config.vector_store.collection
        ))
    );
    Ok(())
}

fn confirm(namespace: &str) -> Result<bool> {
    eprint!(
        "Delete every vector in namespace '{}'? This cannot be undone. [y/N] ",
        namespace
    );
    std::io::stderr().flush().ok();

    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
