//! Periodic progress reporting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::repository::DurableStore;
use crate::work_queue::{JobCounts, WorkQueueBackend};

/// Throughput and ETA derived from two record counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub records_added: u64,
    pub per_minute: f64,
    /// `None` while nothing has been added yet.
    pub eta: Option<Duration>,
}

/// Linear throughput and ETA for the run so far.
pub fn progress(start: u64, current: u64, target: u64, elapsed: Duration) -> Progress {
    let records_added = current.saturating_sub(start);
    let minutes = elapsed.as_secs_f64() / 60.0;
    let per_minute = if minutes > 0.0 {
        records_added as f64 / minutes
    } else {
        0.0
    };

    let eta = if current >= target {
        Some(Duration::ZERO)
    } else if per_minute > 0.0 {
        let remaining = (target - current) as f64;
        Some(Duration::from_secs_f64(remaining / per_minute * 60.0))
    } else {
        None
    };

    Progress {
        records_added,
        per_minute,
        eta,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub counts: JobCounts,
    pub harvested: u64,
    pub target: u64,
    pub progress: Progress,
}

pub struct Monitor {
    queue: Arc<dyn WorkQueueBackend>,
    store: Arc<dyn DurableStore>,
    target: u64,
    start_count: u64,
    started: Instant,
}

impl Monitor {
    pub fn new(
        queue: Arc<dyn WorkQueueBackend>,
        store: Arc<dyn DurableStore>,
        target: u64,
        start_count: u64,
    ) -> Self {
        Self {
            queue,
            store,
            target,
            start_count,
            started: Instant::now(),
        }
    }

    pub async fn snapshot(&self) -> anyhow::Result<Snapshot> {
        let counts = self.queue.counts().await?;
        let harvested = self.store.harvested_count().await?;
        Ok(Snapshot {
            counts,
            harvested,
            target: self.target,
            progress: progress(self.start_count, harvested, self.target, self.started.elapsed()),
        })
    }

    async fn report(&self) {
        match self.snapshot().await {
            Ok(s) => info!(
                "Queue: {} waiting, {} active, {} delayed, {} completed, {} failed | \
                 records {}/{} (+{}, {:.1}/min, ETA {})",
                s.counts.waiting,
                s.counts.active,
                s.counts.delayed,
                s.counts.completed,
                s.counts.failed,
                s.harvested,
                s.target,
                s.progress.records_added,
                s.progress.per_minute,
                format_eta(s.progress.eta)
            ),
            Err(e) => warn!("Monitor failed to read progress: {}", e),
        }
    }

    /// Report every `interval` until `stop` turns true.
    pub fn spawn(self, interval: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            // The first tick fires immediately.
            ticker.tick().await;
            while !*stop.borrow() {
                tokio::select! {
                    _ = ticker.tick() => self.report().await,
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        None => "unknown".to_string(),
        Some(d) => {
            let secs = d.as_secs();
            if secs >= 3_600 {
                format!("{}h{:02}m", secs / 3_600, (secs % 3_600) / 60)
            } else if secs >= 60 {
                format!("{}m{:02}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        }
    }
}
