//! coverscrape - exhaustive-coverage scrape orchestrator.
//!
//! Drives a search-only data source to full coverage: generates search
//! terms, keeps the work queue free of redundant jobs, and keeps an expiring
//! bearer token fresh while workers run.

mod cli;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    let default_filter = if cli::is_verbose() {
        "coverscrape=info"
    } else {
        "coverscrape=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
