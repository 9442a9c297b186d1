//! Run command: workers, token refresh and the orchestration loop.

use std::sync::Arc;

use console::style;
use tracing::{info, warn};

use coverscrape::config::Config;
use coverscrape::credentials::RefreshSchedule;
use coverscrape::executor::{HttpSearchExecutor, SearchExecutor};
use coverscrape::orchestrator::{format_eta, Orchestrator, StopSignal};
use coverscrape::work_queue::{DedupOptions, QueueDedupController, WorkerPool, WorkerPoolConfig};

use super::helpers::{build_credentials, build_explorer, open_queue, open_store, print_kv};

pub async fn cmd_run(
    mut config: Config,
    coverage_target: Option<u64>,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    if let Some(target) = coverage_target {
        config.orchestrator.coverage_target = target;
    }
    if let Some(workers) = workers {
        config.workers.concurrency = workers.max(1);
    }
    if config.source.search_url.is_empty() {
        anyhow::bail!("source.search_url is not configured");
    }

    let store = open_store(&config).await?;
    let queue = open_queue(&config).await?;
    let explorer = build_explorer(&config, Arc::clone(&store))?;
    let controller = Arc::new(QueueDedupController::new(
        Arc::clone(&queue),
        Arc::clone(&store),
    ));
    let executor: Arc<dyn SearchExecutor> = Arc::new(HttpSearchExecutor::new(config.source.clone())?);

    let credentials = build_credentials(&config);
    let schedule = RefreshSchedule::parse(&config.credentials.refresh_schedule)?;
    if credentials.start_auto_refresh(&schedule).await {
        info!("Token refresh scheduled every {:?}", schedule.period());
    }

    let stop = StopSignal::new();
    spawn_signal_handler(stop.clone());

    let pool = WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&explorer),
        Arc::clone(&credentials),
        executor,
        WorkerPoolConfig::from(&config.workers),
    );
    let totals = pool.totals();
    let worker_handles = pool.spawn(stop.subscribe());

    println!(
        "{} Running with {} worker(s) toward {} records",
        style("→").cyan(),
        config.workers.concurrency,
        config.orchestrator.coverage_target
    );

    let orchestrator = Orchestrator::new(
        explorer,
        controller,
        queue,
        Arc::clone(&store),
        config.orchestrator.clone(),
    )
    .with_dedup_options(DedupOptions {
        verbose: config.dedup.verbose,
        show_progress: config.dedup.show_progress,
    })
    .with_stop_signal(stop.clone());

    let outcome = orchestrator.run().await;

    // Shutdown order: schedulers, then workers (in-flight jobs finish), then the browser.
    credentials.stop_auto_refresh().await;
    stop.stop();
    for handle in worker_handles {
        if let Err(e) = handle.await {
            warn!("Worker task ended abnormally: {}", e);
        }
    }
    credentials.cleanup().await;

    let summary = outcome?;
    if summary.target_reached {
        println!("{} Coverage target reached", style("✓").green());
    } else {
        println!("{} Stopped before reaching the coverage target", style("!").yellow());
    }
    print_kv("Elapsed", format_eta(Some(summary.elapsed)));
    print_kv("Records added", summary.records_added);
    print_kv("Batches processed", summary.batches_processed);
    print_kv("Terms queued", summary.terms_queued);
    print_kv("Jobs completed", totals.completed());
    print_kv("Jobs failed", totals.failed());
    Ok(())
}

/// Request a stop on SIGINT or SIGTERM.
fn spawn_signal_handler(stop: StopSignal) {
    tokio::spawn(async move {
        wait_for_shutdown().await;
        println!("\n{} Stopping after the current cycle...", style("!").yellow());
        stop.stop();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
