//! History of issued search terms.
//!
//! Seeded from every analytics term and every completion record, then
//! reloaded from the store at most once per refresh interval. Terms marked
//! locally between reloads are kept.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::gate::IssuedSet;
use crate::repository::{DurableStore, StoreResult};

struct HistoryState {
    issued: IssuedSet,
    last_refresh: Option<Instant>,
}

pub struct TermHistory {
    store: Arc<dyn DurableStore>,
    refresh_interval: Duration,
    state: Mutex<HistoryState>,
}

impl TermHistory {
    pub fn new(store: Arc<dyn DurableStore>, refresh_interval: Duration) -> Self {
        Self {
            store,
            refresh_interval,
            state: Mutex::new(HistoryState {
                issued: IssuedSet::new(),
                last_refresh: None,
            }),
        }
    }

    /// Reload from the store unconditionally.
    pub async fn refresh(&self) -> StoreResult<usize> {
        let analytics = self.store.all_analytics().await?;
        let completed = self.store.completed_terms().await?;

        let mut state = self.state.lock().await;
        state.issued.extend(analytics.iter().map(|r| r.term.as_str()));
        state.issued.extend(completed.iter());
        state.last_refresh = Some(Instant::now());
        debug!("Term history holds {} issued terms", state.issued.len());
        Ok(state.issued.len())
    }

    /// Reload if never loaded or the interval elapsed. A failed reload keeps
    /// the current set and is retried on the next call.
    pub async fn refresh_if_due(&self) {
        let due = {
            let state = self.state.lock().await;
            state
                .last_refresh
                .map_or(true, |t| t.elapsed() >= self.refresh_interval)
        };
        if due {
            if let Err(e) = self.refresh().await {
                warn!("Failed to reload term history: {}", e);
            }
        }
    }

    pub async fn mark_used(&self, term: &str) {
        self.state.lock().await.issued.insert(term);
    }

    pub async fn contains(&self, term: &str) -> bool {
        self.state.lock().await.issued.contains(term)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.issued.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.issued.is_empty()
    }

    /// Run `f` with exclusive access to the issued set.
    pub async fn with_issued<R>(&self, f: impl FnOnce(&mut IssuedSet) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state.issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{AnalyticsUpdate, InMemoryStore, ScrapeJobRecord};
    use chrono::Utc;

    #[tokio::test]
    async fn test_seeds_from_analytics_and_completions() {
        let store = InMemoryStore::new();
        store
            .upsert_analytics(&AnalyticsUpdate::new("Oak", 3, true), None)
            .await
            .unwrap();
        store
            .record_completion(&ScrapeJobRecord {
                job_id: "job-1".to_string(),
                term: "Elm".to_string(),
                result_count: 1,
                records_saved: 1,
                completed_at: Utc::now(),
            })
            .await
            .unwrap();

        let history = TermHistory::new(Arc::new(store), Duration::from_secs(300));
        history.refresh_if_due().await;
        assert!(history.contains("Oak").await);
        assert!(history.contains("Elm").await);
        assert_eq!(history.len().await, 2);
    }

    #[tokio::test]
    async fn test_refresh_is_bounded_by_interval() {
        let store = InMemoryStore::new();
        let history = TermHistory::new(Arc::new(store.clone()), Duration::from_secs(300));
        history.refresh_if_due().await;

        store
            .upsert_analytics(&AnalyticsUpdate::new("Pine", 1, true), None)
            .await
            .unwrap();
        history.refresh_if_due().await;
        assert!(!history.contains("Pine").await);

        history.refresh().await.unwrap();
        assert!(history.contains("Pine").await);
    }

    #[tokio::test]
    async fn test_zero_interval_reloads_every_call() {
        let store = InMemoryStore::new();
        let history = TermHistory::new(Arc::new(store.clone()), Duration::ZERO);
        history.refresh_if_due().await;
        store
            .upsert_analytics(&AnalyticsUpdate::new("Pine", 1, true), None)
            .await
            .unwrap();
        history.refresh_if_due().await;
        assert!(history.contains("Pine").await);
    }

    #[tokio::test]
    async fn test_local_marks_survive_reload() {
        let history = TermHistory::new(Arc::new(InMemoryStore::new()), Duration::ZERO);
        history.mark_used("Cedar").await;
        history.refresh().await.unwrap();
        assert!(history.contains("Cedar").await);
    }
}
