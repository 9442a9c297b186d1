//! Dedup the live queue or a snapshot file.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use console::style;
use serde::{Deserialize, Serialize};

use coverscrape::config::{Config, QueueBackendKind};
use coverscrape::work_queue::{
    DedupOptions, InMemoryQueue, JobOptions, QueueDedupController, WorkQueueBackend,
};

use super::helpers::{open_queue, open_store};

/// One pending job in a snapshot file.
#[derive(Debug, Serialize, Deserialize)]
struct PendingJob {
    term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<u32>,
}

pub async fn cmd_dedup(
    config: &Config,
    jobs_path: Option<&Path>,
    verbose: bool,
    progress: bool,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let queue: Arc<dyn WorkQueueBackend> = match jobs_path {
        Some(path) => load_snapshot(config, path).await?,
        None => {
            if config.queue.backend == QueueBackendKind::Memory {
                anyhow::bail!("the memory queue only lives inside `run`; pass --jobs <snapshot>");
            }
            let queue = open_queue(config).await?;
            let counts = queue.counts().await?;
            println!(
                "{} Deduplicating the live queue: {} waiting, {} delayed",
                style("→").cyan(),
                counts.waiting,
                counts.delayed
            );
            queue
        }
    };

    let store = open_store(config).await?;
    let controller = QueueDedupController::new(Arc::clone(&queue), store);
    let options = DedupOptions {
        verbose: verbose || config.dedup.verbose,
        show_progress: progress || config.dedup.show_progress,
    };
    let result = controller.remove_duplicates_from_queue(options).await;

    if let Some(path) = output {
        let mut pending = queue.waiting().await?;
        pending.extend(queue.delayed().await?);
        let survivors: Vec<PendingJob> = pending
            .into_iter()
            .map(|job| PendingJob {
                term: job.term,
                priority: job.priority,
            })
            .collect();
        tokio::fs::write(path, serde_json::to_string_pretty(&survivors)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!(
            "{} Wrote {} job(s) to {}",
            style("✓").green(),
            survivors.len(),
            path.display()
        );
    }

    if result.failed > 0 {
        anyhow::bail!("{} removal(s) failed", result.failed);
    }
    Ok(())
}

/// Load a snapshot file into a scratch in-memory queue.
async fn load_snapshot(
    config: &Config,
    jobs_path: &Path,
) -> anyhow::Result<Arc<dyn WorkQueueBackend>> {
    let contents = tokio::fs::read_to_string(jobs_path)
        .await
        .with_context(|| format!("reading {}", jobs_path.display()))?;
    let jobs: Vec<PendingJob> = serde_json::from_str(&contents)
        .with_context(|| format!("parsing {}", jobs_path.display()))?;

    let queue = InMemoryQueue::new();
    for job in &jobs {
        let options = JobOptions {
            priority: job.priority,
            ..config.orchestrator.job_options()
        };
        queue.add(&job.term, options).await?;
    }
    println!(
        "{} Loaded {} pending job(s) from {}",
        style("→").cyan(),
        jobs.len(),
        jobs_path.display()
    );
    Ok(Arc::new(queue))
}
