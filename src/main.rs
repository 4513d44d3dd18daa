use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use policy_rag::cli::commands::{
    handle_ask, handle_chunk, handle_clear, handle_config, handle_ingest, handle_search,
    handle_status,
};
use policy_rag::cli::{Cli, Commands, shutdown_signal};
use policy_rag::models::{Config, OutputFormat};

/// Detect ONNX Runtime library path and set ORT_DYLIB_PATH if not already set.
/// Must be called before any ort code runs.
fn detect_and_set_ort_path() {
    if std::env::var("ORT_DYLIB_PATH")
        .map(|p| Path::new(&p).exists())
        .unwrap_or(false)
    {
        return;
    }

    let home = std::env::var("HOME").unwrap_or_default();

    let found = if cfg!(target_os = "macos") {
        [
            format!("{home}/.local/lib/policy-rag/libonnxruntime.dylib"),
            "/opt/homebrew/opt/onnxruntime/lib/libonnxruntime.dylib".into(),
            "/usr/local/opt/onnxruntime/lib/libonnxruntime.dylib".into(),
        ]
        .into_iter()
        .find(|p| Path::new(p).exists())
    } else if cfg!(target_os = "linux") {
        [
            format!("{home}/.local/lib/policy-rag/libonnxruntime.so"),
            "/usr/lib/libonnxruntime.so".into(),
            "/usr/local/lib/libonnxruntime.so".into(),
            "/usr/lib/x86_64-linux-gnu/libonnxruntime.so".into(),
            "/usr/lib/aarch64-linux-gnu/libonnxruntime.so".into(),
        ]
        .into_iter()
        .find(|p| Path::new(p).exists())
    } else {
        None
    };

    if let Some(path) = found {
        // SAFETY: Called at program start before any threads are spawned.
        unsafe {
            std::env::set_var("ORT_DYLIB_PATH", path);
        }
    }
}

/// Logs go to stderr so command output stays pipeable.
/// `RUST_LOG` wins, then `--verbose`, then `log_level` from the config.
fn init_tracing(verbose: bool, log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { log_level };
        EnvFilter::new(format!("policy_rag={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    detect_and_set_ort_path();
    dotenvy::dotenv().ok();

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(run())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(cli.verbose, &config.log_level);

    let format = cli.format.unwrap_or_default();
    let verbose = cli.verbose;

    match cli.command {
        // Ingestion watches for signals itself so it can stop between batches.
        Commands::Ingest(args) => handle_ingest(args, &config, format, verbose).await,
        command => {
            tokio::select! {
                result = run_command(command, &config, cli.config.as_deref(), format, verbose) => result,
                _ = shutdown_signal() => {
                    eprintln!("\nReceived shutdown signal, cleaning up...");
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                    Ok(())
                }
            }
        }
    }
}

async fn run_command(
    command: Commands,
    config: &Config,
    config_path: Option<&Path>,
    format: OutputFormat,
    verbose: bool,
) -> Result<()> {
    match command {
        Commands::Ingest(args) => handle_ingest(args, config, format, verbose).await?,
        Commands::Search(args) => handle_search(args, config, format, verbose).await?,
        Commands::Ask(args) => handle_ask(args, config, format, verbose).await?,
        Commands::Chunk(args) => handle_chunk(args, config, format, verbose).await?,
        Commands::Status => handle_status(config, format, verbose).await?,
        Commands::Clear(args) => handle_clear(args, config, format, verbose).await?,
        Commands::Config(cmd) => handle_config(cmd, config, config_path, format).await?,
    }

    Ok(())
}
