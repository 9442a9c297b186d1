//! Worker pool that drains the queue.
//!
//! Each worker claims a job, searches its term with the current bearer
//! token, records the outcome and completion, then pauses for a random
//! interval. A rejected token triggers one refresh and one retry.
//!
//! A job is only completed or failed after its analytics outcome is stored.
//! When that write fails the job stays active and the queue redelivers it
//! once its lock expires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{FailOutcome, Job, WorkQueueBackend};
use crate::config::WorkerConfig;
use crate::credentials::CredentialManager;
use crate::executor::{ExecutorError, SearchExecutor, SearchPage};
use crate::explorer::SearchSpaceExplorer;
use crate::humanize;
use crate::repository::{DurableStore, OutcomeKey, ScrapeJobRecord};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Running totals across all workers.
#[derive(Debug, Default)]
pub struct WorkerTotals {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub records_saved: AtomicU64,
}

impl WorkerTotals {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn records_saved(&self) -> u64 {
        self.records_saved.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct WorkerContext {
    queue: Arc<dyn WorkQueueBackend>,
    store: Arc<dyn DurableStore>,
    explorer: Arc<SearchSpaceExplorer>,
    credentials: Arc<CredentialManager>,
    executor: Arc<dyn SearchExecutor>,
    config: WorkerPoolConfig,
    totals: Arc<WorkerTotals>,
}

pub struct WorkerPool {
    ctx: WorkerContext,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn WorkQueueBackend>,
        store: Arc<dyn DurableStore>,
        explorer: Arc<SearchSpaceExplorer>,
        credentials: Arc<CredentialManager>,
        executor: Arc<dyn SearchExecutor>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            ctx: WorkerContext {
                queue,
                store,
                explorer,
                credentials,
                executor,
                config,
                totals: Arc::new(WorkerTotals::default()),
            },
        }
    }

    pub fn totals(&self) -> Arc<WorkerTotals> {
        Arc::clone(&self.ctx.totals)
    }

    /// Spawn the workers. They exit once `stop` turns true.
    pub fn spawn(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.ctx.config.concurrency)
            .map(|worker_id| {
                let ctx = self.ctx.clone();
                let stop = stop.clone();
                tokio::spawn(async move { ctx.run(worker_id, stop).await })
            })
            .collect()
    }

    /// Process one job if one is ready. Returns whether a job was claimed.
    pub async fn process_next(&self) -> bool {
        self.ctx.process_next(0).await
    }
}

impl WorkerContext {
    async fn run(self, worker_id: usize, mut stop: watch::Receiver<bool>) {
        debug!("Worker {} started", worker_id);
        while !*stop.borrow() {
            let pause = if self.process_next(worker_id).await {
                humanize::random_delay(
                    self.config.min_delay.as_millis() as u64,
                    self.config.max_delay.as_millis() as u64,
                )
            } else {
                self.config.poll_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Worker {} stopped", worker_id);
    }

    async fn process_next(&self, worker_id: usize) -> bool {
        let job = match self.queue.claim_next().await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(e) => {
                warn!("Worker {} failed to claim a job: {}", worker_id, e);
                return false;
            }
        };
        debug!(
            "Worker {} processing {:?} (job {}, attempt {})",
            worker_id, job.term, job.id, job.attempts_made
        );

        match self.search(&job.term).await {
            Ok(page) => self.succeed(&job, page).await,
            Err(e) => self.fail(&job, &e.to_string()).await,
        }
        true
    }

    async fn search(&self, term: &str) -> Result<SearchPage, ExecutorError> {
        let token = match self.credentials.current_token().await {
            Some(token) => token,
            None => self
                .credentials
                .refresh_token()
                .await
                .ok_or(ExecutorError::Unauthorized(401))?,
        };

        match self.executor.search(term, &token).await {
            Err(e) if e.is_unauthorized() => {
                info!("Token rejected while searching {:?}, refreshing", term);
                match self.credentials.refresh_token().await {
                    Some(fresh) if fresh != token => self.executor.search(term, &fresh).await,
                    _ => Err(e),
                }
            }
            other => other,
        }
    }

    async fn succeed(&self, job: &Job, page: SearchPage) {
        let key = OutcomeKey::new(job.id.as_str(), job.attempts_made);
        if let Err(e) = self
            .explorer
            .record_job_outcome(&key, &job.term, page.result_count, true)
            .await
        {
            warn!(
                "Failed to record analytics for {:?}, leaving job {} for redelivery: {}",
                job.term, job.id, e
            );
            return;
        }

        let record = ScrapeJobRecord {
            job_id: job.id.clone(),
            term: job.term.clone(),
            result_count: page.result_count,
            records_saved: page.records.len() as u64,
            completed_at: Utc::now(),
        };
        match self.store.record_completion(&record).await {
            Ok(true) => {
                self.totals
                    .records_saved
                    .fetch_add(record.records_saved, Ordering::Relaxed);
            }
            Ok(false) => debug!("Job {} already has a completion record", job.id),
            Err(e) => {
                self.fail(job, &format!("failed to record completion: {}", e))
                    .await;
                return;
            }
        }

        if let Err(e) = self.queue.complete(&job.id).await {
            warn!("Failed to mark job {} complete: {}", job.id, e);
        }
        self.totals.completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{:?}: {} result(s), {} saved",
            job.term, page.result_count, record.records_saved
        );
    }

    async fn fail(&self, job: &Job, error: &str) {
        let key = OutcomeKey::new(job.id.as_str(), job.attempts_made);
        if let Err(e) = self
            .explorer
            .record_job_outcome(&key, &job.term, 0, false)
            .await
        {
            warn!(
                "Failed to record analytics for {:?}, leaving job {} for redelivery: {}",
                job.term, job.id, e
            );
            return;
        }

        match self.queue.fail(&job.id, error).await {
            Ok(FailOutcome::Retrying { retry_in }) => {
                info!("{:?} failed ({}), retrying in {:?}", job.term, error, retry_in);
            }
            Ok(FailOutcome::Failed) => {
                warn!("{:?} failed permanently: {}", job.term, error);
                self.totals.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Failed to report failure of job {}: {}", job.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialOptions, DisabledCapturer};
    use crate::explorer::{TermHistory, WeightTable, WriteRetry};
    use crate::repository::{
        AnalyticsRecord, AnalyticsUpdate, InMemoryStore, StoreError, StoreResult,
    };
    use crate::work_queue::{Backoff, InMemoryQueue, JobOptions, JobState};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    /// Returns `per_term` records per search; rejects tokens not equal to `accept`.
    struct FakeExecutor {
        per_term: usize,
        accept: String,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeExecutor {
        fn new(per_term: usize, accept: &str) -> Self {
            Self {
                per_term,
                accept: accept.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SearchExecutor for FakeExecutor {
        async fn search(&self, term: &str, token: &str) -> Result<SearchPage, ExecutorError> {
            self.calls
                .lock()
                .unwrap()
                .push((term.to_string(), token.to_string()));
            if token != self.accept {
                return Err(ExecutorError::Unauthorized(401));
            }
            Ok(SearchPage {
                records: (0..self.per_term).map(|i| json!({ "id": i })).collect(),
                result_count: self.per_term as u64,
            })
        }
    }

    struct Fixture {
        queue: InMemoryQueue,
        store: InMemoryStore,
        pool: WorkerPool,
    }

    fn fixture(executor: Arc<dyn SearchExecutor>, token: Option<&str>) -> Fixture {
        let queue = InMemoryQueue::new();
        let store = InMemoryStore::new();
        let pool = build_pool(&queue, Arc::new(store.clone()), executor, token);
        Fixture { queue, store, pool }
    }

    fn build_pool(
        queue: &InMemoryQueue,
        shared: Arc<dyn DurableStore>,
        executor: Arc<dyn SearchExecutor>,
        token: Option<&str>,
    ) -> WorkerPool {
        let history = Arc::new(TermHistory::new(Arc::clone(&shared), Duration::from_secs(300)));
        let explorer = Arc::new(
            SearchSpaceExplorer::new(
                Arc::clone(&shared),
                history,
                WeightTable::default(),
                StdRng::seed_from_u64(1),
            )
            .with_write_retry(WriteRetry {
                attempts: 2,
                base_delay: Duration::from_millis(1),
            }),
        );
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(DisabledCapturer::new("no browser in tests")),
            CredentialOptions {
                initial_token: token.map(str::to_string),
                ..Default::default()
            },
        ));
        let config = WorkerPoolConfig {
            concurrency: 2,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            poll_interval: Duration::from_millis(5),
        };
        WorkerPool::new(
            Arc::new(queue.clone()),
            shared,
            explorer,
            credentials,
            executor,
            config,
        )
    }

    /// Store whose analytics writes conflict while `locked` is set.
    struct LockedAnalyticsStore {
        inner: InMemoryStore,
        locked: AtomicBool,
    }

    #[async_trait]
    impl DurableStore for LockedAnalyticsStore {
        async fn upsert_analytics(
            &self,
            update: &AnalyticsUpdate,
            key: Option<&OutcomeKey>,
        ) -> StoreResult<bool> {
            if self.locked.load(Ordering::SeqCst) {
                return Err(StoreError::WriteConflict("database is locked".to_string()));
            }
            self.inner.upsert_analytics(update, key).await
        }
        async fn get_analytics(&self, term: &str) -> StoreResult<Option<AnalyticsRecord>> {
            self.inner.get_analytics(term).await
        }
        async fn all_analytics(&self) -> StoreResult<Vec<AnalyticsRecord>> {
            self.inner.all_analytics().await
        }
        async fn analytics_count(&self) -> StoreResult<u64> {
            self.inner.analytics_count().await
        }
        async fn completed_terms(&self) -> StoreResult<HashSet<String>> {
            self.inner.completed_terms().await
        }
        async fn record_completion(&self, record: &ScrapeJobRecord) -> StoreResult<bool> {
            self.inner.record_completion(record).await
        }
        async fn harvested_count(&self) -> StoreResult<u64> {
            self.inner.harvested_count().await
        }
    }

    fn single_attempt() -> JobOptions {
        JobOptions {
            attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_records_analytics_and_completion() {
        let fx = fixture(Arc::new(FakeExecutor::new(3, "good-token")), Some("good-token"));
        let id = fx.queue.add("Oak", JobOptions::default()).await.unwrap();

        assert!(fx.pool.process_next().await);
        assert!(!fx.pool.process_next().await);

        let job = fx.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(fx.store.harvested_count().await.unwrap(), 3);
        let record = fx.store.get_analytics("Oak").await.unwrap().unwrap();
        assert_eq!(record.total_results, 3);
        assert_eq!(record.successful_searches, 1);
        assert!(fx.store.completed_terms().await.unwrap().contains("Oak"));

        let totals = fx.pool.totals();
        assert_eq!(totals.completed(), 1);
        assert_eq!(totals.records_saved(), 3);
    }

    #[tokio::test]
    async fn test_unrecorded_outcome_leaves_job_for_redelivery() {
        let queue = InMemoryQueue::with_lock_duration(Duration::ZERO);
        let store = Arc::new(LockedAnalyticsStore {
            inner: InMemoryStore::new(),
            locked: AtomicBool::new(true),
        });
        let pool = build_pool(
            &queue,
            store.clone(),
            Arc::new(FakeExecutor::new(2, "t")),
            Some("t"),
        );
        let id = queue.add("Oak", JobOptions::default()).await.unwrap();

        assert!(pool.process_next().await);
        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(pool.totals().completed(), 0);
        assert!(store.inner.completed_terms().await.unwrap().is_empty());
        assert!(store.inner.get_analytics("Oak").await.unwrap().is_none());

        store.locked.store(false, Ordering::SeqCst);
        assert!(pool.process_next().await);

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 2);
        let record = store.inner.get_analytics("Oak").await.unwrap().unwrap();
        assert_eq!(record.total_searches, 1);
        assert_eq!(store.inner.harvested_count().await.unwrap(), 2);
        assert_eq!(pool.totals().completed(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_failure_is_not_reported_to_queue() {
        let queue = InMemoryQueue::new();
        let store = Arc::new(LockedAnalyticsStore {
            inner: InMemoryStore::new(),
            locked: AtomicBool::new(true),
        });
        let pool = build_pool(
            &queue,
            store.clone(),
            Arc::new(FakeExecutor::new(1, "good-token")),
            Some("stale-token"),
        );
        let id = queue.add("Elm", single_attempt()).await.unwrap();

        assert!(pool.process_next().await);
        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(queue.counts().await.unwrap().failed, 0);
        assert_eq!(pool.totals().failed(), 0);
    }

    #[tokio::test]
    async fn test_rejected_token_fails_job_when_refresh_unavailable() {
        let executor = Arc::new(FakeExecutor::new(1, "good-token"));
        let fx = fixture(executor.clone(), Some("stale-token"));
        let id = fx.queue.add("Elm", single_attempt()).await.unwrap();

        assert!(fx.pool.process_next().await);

        let job = fx.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
        let record = fx.store.get_analytics("Elm").await.unwrap().unwrap();
        assert_eq!(record.failed_searches, 1);
        assert_eq!(fx.store.harvested_count().await.unwrap(), 0);
        assert_eq!(fx.pool.totals().failed(), 1);
    }

    #[tokio::test]
    async fn test_missing_token_fails_without_searching() {
        let executor = Arc::new(FakeExecutor::new(1, "good-token"));
        let fx = fixture(executor.clone(), None);
        fx.queue.add("Ash", single_attempt()).await.unwrap();

        assert!(fx.pool.process_next().await);
        assert!(executor.calls.lock().unwrap().is_empty());
        assert_eq!(fx.queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_spawned_workers_drain_queue_and_stop() {
        let fx = fixture(Arc::new(FakeExecutor::new(2, "t")), Some("t"));
        for term in ["Oak", "Elm", "Ash", "Pine", "Birch"] {
            fx.queue.add(term, JobOptions::default()).await.unwrap();
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = fx.pool.spawn(stop_rx);
        assert_eq!(handles.len(), 2);

        let totals = fx.pool.totals();
        tokio::time::timeout(Duration::from_secs(5), async {
            while totals.completed() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(fx.store.harvested_count().await.unwrap(), 10);
    }
}
