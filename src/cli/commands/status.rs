use anyhow::{Context, Result};

use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat, VectorDriver};
use crate::services::RetrievalOrchestrator;

pub async fn handle_status(config: &Config, format: OutputFormat, _verbose: bool) -> Result<()> {
    let formatter = get_formatter(format);
    let mut orchestrator = RetrievalOrchestrator::from_config(config)
        .await
        .context("failed to initialize retrieval pipeline")?;
    // An unreachable index is reported below rather than failing the command.
    let _ = orchestrator.attach_existing().await;

    let stats = orchestrator.stats().await;
    let health = orchestrator.health_check().await;
    print!("{}", formatter.format_status(&stats, &health));

    if format == OutputFormat::Text && !health.healthy {
        eprintln!();
        if !health.embedding.healthy {
            eprintln!(
                "Warning: embedding provider unavailable at {}",
                config.embedding.url
            );
        }
        if !health.index.healthy {
            match config.vector_store.driver {
                VectorDriver::Qdrant => {
                    eprintln!("Warning: Qdrant not running. Start with: docker-compose up -d qdrant");
                }
                VectorDriver::PostgreSQL => {
                    eprintln!("Warning: PostgreSQL not accessible. Check connection settings.");
                }
                VectorDriver::Memory => {}
            }
        }
    }

    Ok(())
}
