//! In-memory store for single-process operation and tests.
//!
//! State is not persisted across restarts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::models::{AnalyticsRecord, AnalyticsUpdate, OutcomeKey, ScrapeJobRecord};
use super::{DurableStore, StoreResult};

#[derive(Debug, Default)]
struct StoreState {
    analytics: HashMap<String, AnalyticsRecord>,
    applied_outcomes: HashSet<OutcomeKey>,
    completions: HashMap<String, ScrapeJobRecord>,
}

/// In-memory durable store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn upsert_analytics(
        &self,
        update: &AnalyticsUpdate,
        key: Option<&OutcomeKey>,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if let Some(key) = key {
            if !state.applied_outcomes.insert(key.clone()) {
                return Ok(false);
            }
        }
        match state.analytics.get_mut(&update.term) {
            Some(record) => record.apply(update),
            None => {
                state
                    .analytics
                    .insert(update.term.clone(), AnalyticsRecord::from_update(update));
            }
        }
        Ok(true)
    }

    async fn get_analytics(&self, term: &str) -> StoreResult<Option<AnalyticsRecord>> {
        Ok(self.state.read().await.analytics.get(term).cloned())
    }

    async fn all_analytics(&self) -> StoreResult<Vec<AnalyticsRecord>> {
        Ok(self.state.read().await.analytics.values().cloned().collect())
    }

    async fn analytics_count(&self) -> StoreResult<u64> {
        Ok(self.state.read().await.analytics.len() as u64)
    }

    async fn completed_terms(&self) -> StoreResult<HashSet<String>> {
        Ok(self
            .state
            .read()
            .await
            .completions
            .values()
            .map(|r| r.term.clone())
            .collect())
    }

    async fn record_completion(&self, record: &ScrapeJobRecord) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if state.completions.contains_key(&record.job_id) {
            return Ok(false);
        }
        state
            .completions
            .insert(record.job_id.clone(), record.clone());
        Ok(true)
    }

    async fn harvested_count(&self) -> StoreResult<u64> {
        Ok(self
            .state
            .read()
            .await
            .completions
            .values()
            .map(|r| r.records_saved)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn completion(job_id: &str, term: &str, saved: u64) -> ScrapeJobRecord {
        ScrapeJobRecord {
            job_id: job_id.to_string(),
            term: term.to_string(),
            result_count: saved,
            records_saved: saved,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_accumulates() {
        let store = InMemoryStore::new();
        store
            .upsert_analytics(&AnalyticsUpdate::new("Oak", 10, true), None)
            .await
            .unwrap();
        store
            .upsert_analytics(&AnalyticsUpdate::new("Oak", 0, false), None)
            .await
            .unwrap();

        let record = store.get_analytics("Oak").await.unwrap().unwrap();
        assert_eq!(record.total_searches, 2);
        assert_eq!(record.failed_searches, 1);
        assert_eq!(store.analytics_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keyed_upsert_applies_once() {
        let store = InMemoryStore::new();
        let key = OutcomeKey::new("job-1", 1);
        let update = AnalyticsUpdate::new("Oak", 10, true);

        assert!(store.upsert_analytics(&update, Some(&key)).await.unwrap());
        assert!(!store.upsert_analytics(&update, Some(&key)).await.unwrap());

        // A retried attempt is a new key and counts again.
        let retry = OutcomeKey::new("job-1", 2);
        assert!(store.upsert_analytics(&update, Some(&retry)).await.unwrap());

        let record = store.get_analytics("Oak").await.unwrap().unwrap();
        assert_eq!(record.total_searches, 2);
    }

    #[tokio::test]
    async fn test_completion_unique_per_job() {
        let store = InMemoryStore::new();
        assert!(store
            .record_completion(&completion("job-1", "Oak", 5))
            .await
            .unwrap());
        assert!(!store
            .record_completion(&completion("job-1", "Oak", 5))
            .await
            .unwrap());
        assert!(store
            .record_completion(&completion("job-2", "Elm", 7))
            .await
            .unwrap());

        assert_eq!(store.harvested_count().await.unwrap(), 12);
        let terms = store.completed_terms().await.unwrap();
        assert!(terms.contains("Oak"));
        assert!(terms.contains("Elm"));
    }

    #[tokio::test]
    async fn test_empty_term_is_a_valid_key() {
        let store = InMemoryStore::new();
        store
            .record_completion(&completion("job-1", "", 0))
            .await
            .unwrap();
        assert!(store.completed_terms().await.unwrap().contains(""));
    }
}
