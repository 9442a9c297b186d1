//! Re-queue the terms of failed jobs.

use console::style;

use coverscrape::config::{Config, QueueBackendKind};
use coverscrape::work_queue::{QueueDedupController, RetryOptions};

use super::helpers::{open_queue, open_store};

pub async fn cmd_retry_failed(
    config: &Config,
    delay_ms: Option<u64>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    if config.queue.backend == QueueBackendKind::Memory {
        anyhow::bail!("the memory queue keeps no failed jobs between runs");
    }

    let queue = open_queue(config).await?;
    let store = open_store(config).await?;
    let controller = QueueDedupController::new(queue, store);

    let options = RetryOptions {
        limit: limit.unwrap_or(config.queue.retry_limit),
        pace: delay_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or_else(|| config.queue.retry_delay()),
        job: config.orchestrator.job_options(),
    };
    let mut stdout = std::io::stdout();
    let result = controller.retry_failed(&options, &mut stdout).await?;

    if !result.failed.is_empty() {
        println!(
            "{} {} term(s) could not be queued",
            style("!").yellow(),
            result.failed.len()
        );
    }
    Ok(())
}
