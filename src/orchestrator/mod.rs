//! Orchestration loop.
//!
//! Runs admission cycles until the store's harvested count reaches the
//! coverage target or a stop is requested. A cycle admits one explorer batch
//! while the queue is below its low-water mark, periodically runs queue
//! dedup, then sleeps. Sleeps wake early on stop.

mod monitor;

pub use monitor::{format_eta, progress, Monitor, Progress, Snapshot};

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::explorer::SearchSpaceExplorer;
use crate::repository::{DurableStore, StoreError};
use crate::work_queue::{
    AdmissionResult, DedupOptions, QueueDedupController, QueueError, WorkQueueBackend,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Cooperative stop flag shared by the loop, the workers and the monitor.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub records_added: u64,
    pub batches_processed: u64,
    pub terms_queued: u64,
    pub target_reached: bool,
}

pub struct Orchestrator {
    explorer: Arc<SearchSpaceExplorer>,
    controller: Arc<QueueDedupController>,
    queue: Arc<dyn WorkQueueBackend>,
    store: Arc<dyn DurableStore>,
    config: OrchestratorConfig,
    dedup: DedupOptions,
    stop: StopSignal,
}

impl Orchestrator {
    pub fn new(
        explorer: Arc<SearchSpaceExplorer>,
        controller: Arc<QueueDedupController>,
        queue: Arc<dyn WorkQueueBackend>,
        store: Arc<dyn DurableStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            explorer,
            controller,
            queue,
            store,
            config,
            dedup: DedupOptions::default(),
            stop: StopSignal::new(),
        }
    }

    pub fn with_dedup_options(mut self, dedup: DedupOptions) -> Self {
        self.dedup = dedup;
        self
    }

    /// Share an existing stop signal, e.g. the one wired to SIGINT.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub async fn run(&self) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();
        let start_count = self.store.harvested_count().await?;
        let target = self.config.coverage_target;
        info!(
            "Starting orchestration: {} of {} records harvested",
            start_count, target
        );

        let (monitor_stop, monitor_rx) = watch::channel(false);
        let monitor = Monitor::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            target,
            start_count,
        )
        .spawn(self.config.monitor_interval(), monitor_rx);

        let mut stop = self.stop.subscribe();
        let mut current = start_count;
        let mut cycle: u64 = 0;
        let mut batches_processed = 0;
        let mut terms_queued = 0;
        let mut target_reached = false;

        loop {
            if self.stop.is_stopped() {
                info!("Stop requested, ending orchestration");
                break;
            }
            cycle += 1;

            match self.store.harvested_count().await {
                Ok(count) => current = count,
                Err(e) => warn!("Failed to read harvested count: {}", e),
            }
            if current >= target {
                target_reached = true;
                info!("Coverage target reached: {} of {} records", current, target);
                break;
            }

            match self.queue.counts().await {
                Ok(counts) if counts.in_flight() < self.config.low_water_mark => {
                    match self.admit_batch().await {
                        Ok(result) if result.queued > 0 => {
                            batches_processed += 1;
                            terms_queued += result.queued as u64;
                        }
                        Ok(_) => debug!("Batch produced no new jobs"),
                        Err(e) => warn!("Batch admission failed: {}", e),
                    }
                }
                Ok(counts) => debug!(
                    "Queue depth {} at or above low-water mark {}, skipping admission",
                    counts.in_flight(),
                    self.config.low_water_mark
                ),
                Err(e) => warn!("Failed to read queue counts: {}", e),
            }

            let every = self.config.dedup_every_cycles;
            if every > 0 && cycle % every == 0 {
                let result = self.controller.remove_duplicates_from_queue(self.dedup).await;
                debug!(
                    "Periodic dedup removed {} job(s), {} failed",
                    result.removed, result.failed
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.inter_batch_delay()) => {}
                _ = stop.changed() => {}
            }
        }

        monitor_stop.send_replace(true);
        if let Err(e) = monitor.await {
            warn!("Monitor task ended abnormally: {}", e);
        }

        let summary = RunSummary {
            elapsed: started.elapsed(),
            records_added: current.saturating_sub(start_count),
            batches_processed,
            terms_queued,
            target_reached,
        };
        info!(
            "Orchestration finished in {:?}: {} record(s) added, {} batch(es)",
            summary.elapsed, summary.records_added, summary.batches_processed
        );
        Ok(summary)
    }

    async fn admit_batch(&self) -> Result<AdmissionResult, OrchestratorError> {
        let batch = self.explorer.generate_batch(self.config.batch_size).await?;
        let terms: Vec<String> = batch.into_iter().map(|t| t.text).collect();
        let result = match self
            .controller
            .admit(&terms, &self.config.job_options())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.explorer.release(&terms).await;
                return Err(e.into());
            }
        };
        self.explorer.release(&result.failed).await;
        info!(
            "Admitted batch: {} queued, {} skipped, {} failed",
            result.queued,
            result.skipped,
            result.failed.len()
        );
        Ok(result)
    }
}
