//! One-shot token capture.

use console::style;

use coverscrape::config::Config;

use super::helpers::{build_credentials, print_kv};

pub async fn cmd_token(config: &Config) -> anyhow::Result<()> {
    let credentials = build_credentials(config);

    println!("{} Capturing token...", style("→").cyan());
    let token = credentials.refresh_token().await;
    credentials.cleanup().await;

    let stats = credentials.stats().await;
    let health = credentials.health().await;

    match token {
        Some(_) => println!("{} Token available", style("✓").green()),
        None => println!("{} No token available", style("✗").red()),
    }
    print_kv("Preview", stats.token_preview.as_deref().unwrap_or("-"));
    print_kv(
        "Source",
        stats.source.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
    );
    print_kv("Refreshes", stats.refresh_count);
    print_kv("Failures", stats.failure_count);
    print_kv("Failure rate", &health.failure_rate);
    print_kv("Browser refresh", stats.browser_refresh_enabled);
    print_kv(
        "Health",
        if health.healthy {
            style("healthy").green()
        } else {
            style("unhealthy").red()
        },
    );

    if token.is_none() {
        anyhow::bail!("token capture failed");
    }
    Ok(())
}
