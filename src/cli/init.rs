//! Initialize command.

use console::style;

use coverscrape::config::Config;

use super::helpers::{open_queue, open_store, print_kv};

/// Create the data directory and database schema.
pub async fn cmd_init(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let counts = open_queue(config).await?.counts().await?;
    let terms = store.analytics_count().await?;
    let harvested = store.harvested_count().await?;

    println!(
        "{} Initialized coverscrape database at {}",
        style("✓").green(),
        config.database_path().display()
    );
    print_kv("Known terms", terms);
    print_kv("Harvested records", harvested);
    print_kv("Queued jobs", counts.waiting + counts.delayed);
    print_kv("Failed jobs", counts.failed);

    if config.source.search_url.is_empty() {
        println!(
            "{} No source.search_url configured; `run` needs one",
            style("!").yellow()
        );
    }
    if config.credentials.initial_token.is_none() && config.browser.target_url.is_empty() {
        println!(
            "{} No token source: set SOURCE_BEARER_TOKEN or browser.target_url",
            style("!").yellow()
        );
    }
    Ok(())
}
