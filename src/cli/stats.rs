//! Term performance statistics.

use console::style;

use coverscrape::config::Config;

use super::helpers::{build_explorer, open_store, print_kv};

pub async fn cmd_stats(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let harvested = store.harvested_count().await?;
    let explorer = build_explorer(config, store)?;
    let stats = explorer.performance_stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{}", style("Search performance").bold());
    print_kv("Harvested records", format!("{} / {}", harvested, config.orchestrator.coverage_target));
    print_kv("Terms", stats.total_terms);
    print_kv("Searches", stats.total_searches);
    print_kv("Failed searches", stats.failed_searches);
    print_kv("Results", stats.total_results);
    print_kv(
        "Success rate",
        format!("{:.1}%", stats.overall_success_rate * 100.0),
    );
    print_kv("Avg efficiency", format!("{:.2}", stats.average_efficiency));

    if !stats.top_terms.is_empty() {
        println!();
        println!("{}", style("Top terms").bold());
        for term in &stats.top_terms {
            println!(
                "  {:<24} {:>8.1} results/search  {:>5.1}% ok  ({} searches)",
                term.term,
                term.efficiency,
                term.success_rate * 100.0,
                term.total_searches
            );
        }
    }

    if !stats.by_length.is_empty() {
        println!();
        println!("{}", style("By term length").bold());
        for row in &stats.by_length {
            println!(
                "  {:>3} chars  {:>6} terms  {:>8.1} results/search",
                row.term_length, row.terms, row.average_efficiency
            );
        }
    }
    Ok(())
}
