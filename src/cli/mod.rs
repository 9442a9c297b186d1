//! CLI parser and command dispatch.

mod dedup;
mod helpers;
mod init;
mod retry;
mod run;
mod stats;
mod terms;
mod token;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use coverscrape::config::Config;

#[derive(Parser)]
#[command(name = "coverscrape")]
#[command(about = "Exhaustive-coverage scrape orchestrator for search-only data sources")]
#[command(version)]
pub struct Cli {
    /// Target directory or database file (overrides config file).
    /// Can be a directory containing coverscrape.db or a .db file directly.
    #[arg(long, short = 't', global = true)]
    target: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and database schema
    Init,

    /// Run workers, token refresh and the orchestration loop until the coverage target is met
    Run {
        /// Override the coverage target
        #[arg(long)]
        coverage_target: Option<u64>,
        /// Override the number of workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Deduplicate the queue against itself and the completion history.
    /// With --verbose, previews the affected terms.
    Dedup {
        /// Work on a JSON snapshot instead of the live queue:
        /// [{"term": "...", "priority": 5}, ...]
        #[arg(long)]
        jobs: Option<PathBuf>,
        /// Print progress every ten removals
        #[arg(short = 'P', long)]
        progress: bool,
        /// Write the surviving jobs to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Re-queue the unique terms of recently failed jobs, one at a time
    RetryFailed {
        /// Pause between submissions in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Number of most recent failed jobs to look at
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Capture a token once and print credential stats and health
    Token,

    /// Print search terms
    Terms {
        /// Number of terms to generate
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,
        /// List analytics-ranked terms instead of generating new ones
        #[arg(long)]
        optimized: bool,
    },

    /// Show term performance statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).await?;

    match cli.command {
        Commands::Init => init::cmd_init(&config).await,
        Commands::Run {
            coverage_target,
            workers,
        } => run::cmd_run(config, coverage_target, workers).await,
        Commands::Dedup {
            jobs,
            progress,
            output,
        } => {
            dedup::cmd_dedup(&config, jobs.as_deref(), cli.verbose, progress, output.as_deref())
                .await
        }
        Commands::RetryFailed { delay_ms, limit } => {
            retry::cmd_retry_failed(&config, delay_ms, limit).await
        }
        Commands::Token => token::cmd_token(&config).await,
        Commands::Terms { count, optimized } => terms::cmd_terms(&config, count, optimized).await,
        Commands::Stats { json } => stats::cmd_stats(&config, json).await,
    }
}

async fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match cli.config {
        Some(ref path) => Config::load_from_path(path).await?.with_env_overrides()?,
        None => Config::load().await?,
    };
    if let Some(ref target) = cli.target {
        config.set_database_target(target);
    }
    config.validate()?;
    Ok(config)
}
