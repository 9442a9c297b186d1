//! Print generated or analytics-ranked terms.

use console::style;

use coverscrape::config::Config;

use super::helpers::{build_explorer, open_store};

pub async fn cmd_terms(config: &Config, count: usize, optimized: bool) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let explorer = build_explorer(config, store)?;

    if optimized {
        let mut options = config.explorer.optimization.clone();
        options.max_terms_to_return = count;
        let ranked = explorer.optimized_terms(&options).await?;
        if ranked.is_empty() {
            println!("{} No terms match the optimization filters", style("!").yellow());
            return Ok(());
        }
        for record in ranked {
            println!(
                "{:<28} {:>8.1} results/search  {:>5.1}% ok",
                record.term,
                record.efficiency(),
                record.success_rate() * 100.0
            );
        }
        return Ok(());
    }

    if explorer.is_database_empty().await? {
        println!("{} No analytics yet; starter terms follow", style("→").cyan());
    }
    for term in explorer.generate_batch(count).await? {
        match term.strategy {
            Some(strategy) => println!("{:<28} {}", term.text, style(strategy).dim()),
            None => println!("{}", term.text),
        }
    }
    Ok(())
}
