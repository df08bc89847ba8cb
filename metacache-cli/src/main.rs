//! metacache command line tools: seed tile caches and check configurations.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

#[derive(Debug, Parser)]
#[command(name = "metacache", version, about = "Tile cache seeder and tools")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, default_value = "metacache.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pre-generate tiles for a tileset
    Seed(commands::seed::SeedArgs),
    /// Validate the configuration and print a summary
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let registry = metacache::config::load_file(&cli.config)
        .await
        .map_err(|err| CliError::Config(err.to_string()))?;
    match cli.command {
        Command::Seed(args) => commands::seed::run(&registry, args).await,
        Command::Check => commands::check::run(&registry),
    }
}
