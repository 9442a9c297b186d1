//! End-to-end orchestration against in-process fakes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use coverscrape::config::OrchestratorConfig;
use coverscrape::credentials::{CredentialManager, CredentialOptions, DisabledCapturer};
use coverscrape::executor::{ExecutorError, SearchExecutor, SearchPage};
use coverscrape::explorer::{SearchSpaceExplorer, TermHistory, WeightTable};
use coverscrape::orchestrator::{Orchestrator, RunSummary, StopSignal};
use coverscrape::repository::{DieselStore, DurableStore, InMemoryStore};
use coverscrape::work_queue::{
    Backoff, DbJobQueue, DedupOptions, InMemoryQueue, JobOptions, QueueDedupController,
    WorkQueueBackend, WorkerPool, WorkerPoolConfig,
};

const TOKEN: &str = "eyJhbGciOiJIUzI1NiJ9.integration";

/// Returns `per_term` records for every term and remembers what it searched.
struct FakeSource {
    per_term: usize,
    searched: Mutex<Vec<String>>,
}

#[async_trait]
impl SearchExecutor for FakeSource {
    async fn search(&self, term: &str, token: &str) -> Result<SearchPage, ExecutorError> {
        if token != TOKEN {
            return Err(ExecutorError::Unauthorized(401));
        }
        self.searched.lock().unwrap().push(term.to_string());
        Ok(SearchPage {
            records: (0..self.per_term)
                .map(|i| json!({ "term": term, "n": i }))
                .collect(),
            result_count: self.per_term as u64,
        })
    }
}

fn orchestrator_config(target: u64) -> OrchestratorConfig {
    OrchestratorConfig {
        coverage_target: target,
        batch_size: 5,
        inter_batch_delay_ms: 20,
        low_water_mark: 10,
        monitor_interval_secs: 1,
        dedup_every_cycles: 2,
        job_attempts: 2,
        job_backoff: Backoff::Fixed { delay_ms: 10 },
        job_priority: None,
    }
}

async fn run_to_target(
    store: Arc<dyn DurableStore>,
    source: Arc<FakeSource>,
    target: u64,
) -> RunSummary {
    run_on_queue(store, Arc::new(InMemoryQueue::new()), source, target).await
}

async fn run_on_queue(
    store: Arc<dyn DurableStore>,
    queue: Arc<dyn WorkQueueBackend>,
    source: Arc<FakeSource>,
    target: u64,
) -> RunSummary {
    let history = Arc::new(TermHistory::new(Arc::clone(&store), Duration::from_secs(300)));
    let explorer = Arc::new(SearchSpaceExplorer::new(
        Arc::clone(&store),
        history,
        WeightTable::default(),
        StdRng::seed_from_u64(2024),
    ));
    let controller = Arc::new(QueueDedupController::new(
        Arc::clone(&queue),
        Arc::clone(&store),
    ));
    let credentials = Arc::new(CredentialManager::new(
        Arc::new(DisabledCapturer::new("no browser in tests")),
        CredentialOptions {
            initial_token: Some(TOKEN.to_string()),
            ..Default::default()
        },
    ));

    let stop = StopSignal::new();
    let pool = WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&explorer),
        credentials,
        source,
        WorkerPoolConfig {
            concurrency: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(3),
            poll_interval: Duration::from_millis(5),
        },
    );
    let workers = pool.spawn(stop.subscribe());

    let orchestrator = Orchestrator::new(
        explorer,
        controller,
        queue,
        Arc::clone(&store),
        orchestrator_config(target),
    )
    .with_stop_signal(stop.clone());

    let summary = tokio::time::timeout(Duration::from_secs(20), orchestrator.run())
        .await
        .expect("orchestration timed out")
        .expect("orchestration failed");

    stop.stop();
    for worker in workers {
        worker.await.unwrap();
    }
    summary
}

#[tokio::test]
async fn test_run_stops_at_coverage_target() {
    let store = InMemoryStore::new();
    let source = Arc::new(FakeSource {
        per_term: 3,
        searched: Mutex::new(Vec::new()),
    });

    let summary = run_to_target(Arc::new(store.clone()), Arc::clone(&source), 30).await;

    assert!(summary.target_reached);
    assert!(summary.batches_processed >= 1);
    assert!(summary.records_added >= 30);
    assert!(store.harvested_count().await.unwrap() >= 30);

    // Every term was searched once.
    let searched = source.searched.lock().unwrap().clone();
    let unique: HashSet<&String> = searched.iter().collect();
    assert_eq!(unique.len(), searched.len());

    // Every searched term is in the analytics ledger.
    for term in &searched {
        let record = store.get_analytics(term).await.unwrap().unwrap();
        assert_eq!(record.total_searches, 1);
        assert_eq!(record.total_results, 3);
    }
}

#[tokio::test]
async fn test_progress_persists_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coverscrape.db");

    let first = DieselStore::from_sqlite_path(&path);
    first.init_schema().await.unwrap();
    let source = Arc::new(FakeSource {
        per_term: 4,
        searched: Mutex::new(Vec::new()),
    });
    let summary = run_to_target(Arc::new(first), Arc::clone(&source), 20).await;
    assert!(summary.target_reached);
    let searched_first: HashSet<String> = source.searched.lock().unwrap().iter().cloned().collect();

    // A fresh process sees the harvested count and the completed terms.
    let reopened = DieselStore::from_sqlite_path(&path);
    reopened.init_schema().await.unwrap();
    assert!(reopened.harvested_count().await.unwrap() >= 20);
    let completed = reopened.completed_terms().await.unwrap();
    assert!(!completed.is_empty());
    assert!(completed.is_subset(&searched_first));

    let second_source = Arc::new(FakeSource {
        per_term: 4,
        searched: Mutex::new(Vec::new()),
    });
    let summary = run_to_target(Arc::new(reopened), Arc::clone(&second_source), 20).await;
    assert!(summary.target_reached);
    assert_eq!(summary.batches_processed, 0);
    assert!(second_source.searched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_sqlite_queue_survives_for_live_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coverscrape.db");
    let lock = Duration::from_secs(300);

    let store = DieselStore::from_sqlite_path(&path);
    store.init_schema().await.unwrap();
    let queue = DbJobQueue::open(&path, lock).await.unwrap();
    let source = Arc::new(FakeSource {
        per_term: 4,
        searched: Mutex::new(Vec::new()),
    });
    let summary = run_on_queue(Arc::new(store), Arc::new(queue), source, 20).await;
    assert!(summary.target_reached);

    // Another process opens the same file.
    let store: Arc<dyn DurableStore> = Arc::new(DieselStore::from_sqlite_path(&path));
    let queue = Arc::new(DbJobQueue::open(&path, lock).await.unwrap());
    let counts = queue.counts().await.unwrap();
    assert!(counts.completed >= 5);
    assert_eq!(counts.active, 0);

    let done = store
        .completed_terms()
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    let with_priority = |priority| JobOptions {
        priority: Some(priority),
        ..Default::default()
    };
    queue.add(&done, with_priority(10)).await.unwrap();
    queue.add("Quillfeather", with_priority(20)).await.unwrap();
    let keeper = queue.add("Quillfeather", with_priority(5)).await.unwrap();

    let controller = QueueDedupController::new(queue.clone(), Arc::clone(&store));
    let result = controller
        .remove_duplicates_with_output(DedupOptions::default(), &mut Vec::new())
        .await;
    assert_eq!(result.removed, 2);
    assert_eq!(result.failed, 0);

    let mut pending = queue.waiting().await.unwrap();
    pending.extend(queue.delayed().await.unwrap());
    let quill: Vec<_> = pending.iter().filter(|j| j.term == "Quillfeather").collect();
    assert_eq!(quill.len(), 1);
    assert_eq!(quill[0].id, keeper);
    assert!(pending.iter().all(|j| j.term != done));
}
