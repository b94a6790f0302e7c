//! Trinity CLI entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use trinity::infrastructure::config::ConfigLoader;
use trinity::infrastructure::{logging, setup};

#[derive(Parser)]
#[command(name = "trinity", version, about = "Deep-agent orchestration platform")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run recovery, start the scheduler, and serve the HTTP API.
    Serve,
    /// Scan interrupted executions and resume, retry, or fail them.
    Recover {
        /// Report what would happen without mutating anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config =
        ConfigLoader::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _log_guard = logging::init(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Commands::Serve => setup::run_server(config).await,
        Commands::Recover { dry_run } => {
            let report = setup::run_recovery(config, dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
