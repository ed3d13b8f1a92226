//! Spendy CLI - reconcile bank messages and statements from the terminal

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use spendy::Reconciler;
use spendy_core::Settings;
use tracing_subscriber::EnvFilter;

mod commands;

/// Spendy - one transaction per purchase, however many messages describe it
#[derive(Parser)]
#[command(name = "spendy", version, about, long_about = None)]
struct Cli {
    /// Config file (TOML). Defaults to config.toml in the data directory
    #[arg(long, env = "SPENDY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_deref())?;
    std::fs::create_dir_all(&settings.storage.uploads_dir).with_context(|| {
        format!("creating uploads directory {}", settings.storage.uploads_dir.display())
    })?;
    let reconciler = Reconciler::open(&settings)
        .await
        .with_context(|| format!("opening database {}", settings.database.path.display()))?;
    commands::run(&reconciler, cli.command).await
}

/// Relative paths in the config resolve against the config file's directory,
/// or the platform data directory when no file was named.
fn load_settings(config: Option<&Path>) -> Result<Settings> {
    let (path, base) = match config {
        Some(path) => {
            let base = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (path.to_path_buf(), base)
        }
        None => {
            let dirs = directories::ProjectDirs::from("com", "spendy", "Spendy")
                .context("no home directory to keep data in")?;
            let data_dir = dirs.data_dir().to_path_buf();
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("creating data directory {}", data_dir.display()))?;
            (data_dir.join("config.toml"), data_dir)
        }
    };
    let mut settings =
        Settings::load(&path).with_context(|| format!("loading config {}", path.display()))?;
    settings.resolve_paths(&base);
    tracing::debug!(config = %path.display(), db = %settings.database.path.display(), "settings loaded");
    Ok(settings)
}
