use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::cli::output::get_formatter;
use crate::models::{
    COMPLETION_API_KEY_ENV, Config, EMBEDDING_API_KEY_ENV, OutputFormat, QDRANT_API_KEY_ENV,
};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    #[command(about = "Show the effective configuration")]
    Show,
    #[command(about = "Write a default configuration file")]
    Init {
        #[arg(long, short = 'f', help = "Force overwrite existing config")]
        force: bool,
    },
    #[command(about = "Show the configuration file path")]
    Path,
}

pub async fn handle_config(
    cmd: ConfigCommand,
    config: &Config,
    config_path: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        ConfigCommand::Show => handle_show(config, format),
        ConfigCommand::Init { force } => handle_init(config_path, force, format),
        ConfigCommand::Path => handle_path(config_path),
    }
}

/// Secrets are replaced before anything is printed.
fn redacted(config: &Config) -> Config {
    let mask = |key: &mut Option<String>| {
        if key.is_some() {
            *key = Some("********".to_string());
        }
    };
    let mut shown = config.clone();
    mask(&mut shown.embedding.api_key);
    mask(&mut shown.generation.api_key);
    mask(&mut shown.vector_store.api_key);
    shown
}

fn handle_show(config: &Config, format: OutputFormat) -> Result<()> {
    let shown = redacted(config);
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }

    let toml = toml::to_string_pretty(&shown).context("failed to render configuration")?;
    if format == OutputFormat::Markdown {
        println!("```toml\n{}```", toml);
    } else {
        println!("{}", toml);
    }
    Ok(())
}

fn handle_init(config_path: Option<&Path>, force: bool, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);
    let target = config_path
        .map(Path::to_path_buf)
        .or_else(Config::config_path)
        .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;

    if target.exists() && !force {
        anyhow::bail!(
            "Config already exists at: {}\nUse --force to overwrite.",
            target.display()
        );
    }

    let path = Config::default()
        .save(Some(&target))
        .context("failed to write config")?;
    println!(
        "{}",
        formatter.format_message(&format!("Created config at: {}", path.display()))
    );
    Ok(())
}

fn handle_path(config_path: Option<&Path>) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .or_else(Config::config_path)
        .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;

    let status = if path.exists() { "active" } else { "not created" };
    println!("Config file ({}): {}", status, path.display());

    if let Ok(cwd) = std::env::current_dir() {
        let env_path = cwd.join(".env");
        if env_path.exists() {
            println!(".env file (active): {}", env_path.display());
        }
    }

    println!();
    println!("Secrets are read from the environment:");
    for var in [EMBEDDING_API_KEY_ENV, COMPLETION_API_KEY_ENV, QDRANT_API_KEY_ENV] {
        let set = if std::env::var(var).is_ok() { "set" } else { "unset" };
        println!("  {} ({})", var, set);
    }
    Ok(())
}
