mod ask;
mod chunk;
mod clear;
mod config;
mod ingest;
mod search;
mod status;

use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::models::{Config, OutputFormat};
use crate::services::RetrievalOrchestrator;

pub use ask::AskArgs;
pub use chunk::ChunkArgs;
pub use clear::ClearArgs;
pub use config::ConfigCommand;
pub use ingest::IngestArgs;
pub use search::SearchArgs;

pub use ask::handle_ask;
pub use chunk::handle_chunk;
pub use clear::handle_clear;
pub use config::handle_config;
pub use ingest::handle_ingest;
pub use search::handle_search;
pub use status::handle_status;

/// Build the orchestrator and pick up vectors left by an earlier run.
async fn open_orchestrator(config: &Config) -> Result<RetrievalOrchestrator> {
    let mut orchestrator = RetrievalOrchestrator::from_config(config)
        .await
        .context("failed to initialize retrieval pipeline")?;
    orchestrator
        .attach_existing()
        .await
        .context("failed to read vector index")?;
    Ok(orchestrator)
}

/// Stderr spinner, hidden for machine-readable output.
fn spinner(format: OutputFormat, message: impl Into<String>) -> ProgressBar {
    if format != OutputFormat::Text {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn check_threshold(threshold: Option<f32>) -> Result<()> {
    if let Some(t) = threshold
        && !(0.0..=1.0).contains(&t)
    {
        anyhow::bail!("threshold must be between 0.0 and 1.0");
    }
    Ok(())
}
