//! Search-space exploration.
//!
//! The explorer decides which terms to search next. With an empty analytics
//! ledger it hands out a curated starter list; afterwards it samples the
//! weighted strategy table. Every candidate passes the acceptance gate and is
//! marked issued as soon as it is accepted; terms that never reach the queue
//! are handed back with [`SearchSpaceExplorer::release`].

pub mod gate;
pub mod history;
pub mod strategy;

pub use gate::{IssuedSet, Rejection};
pub use history::TermHistory;
pub use strategy::{Strategy, WeightTable};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ExplorerConfig;
use crate::repository::{
    AnalyticsRecord, AnalyticsUpdate, DurableStore, OutcomeKey, StoreError, StoreResult,
};

/// Short, high-yield terms used before any analytics exist.
pub const STARTER_TERMS: &[&str] = &[
    "Main", "Oak", "Park", "Lake", "Hill", "Smith", "Johnson", "Lee", "Garcia", "Brown", "Pine",
    "Maple", "Cedar", "Elm", "River", "North", "South", "West", "East", "Church",
];

/// Batch generation gives up after this many attempts per requested term.
const ATTEMPTS_PER_TERM: usize = 10;
/// Terms listed in `PerformanceStats::top_terms`.
const TOP_TERMS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExplorerError {
    #[error("Unknown strategy '{0}'")]
    UnknownStrategy(String),
}

/// A generated candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchTerm {
    pub text: String,
    /// `None` for starter-list terms.
    pub strategy: Option<Strategy>,
}

impl SearchTerm {
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Filters for analytics-ranked terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationOptions {
    pub min_efficiency: f64,
    pub min_success_rate: f64,
    /// Only terms of exactly this many characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_term_length: Option<usize>,
    pub exclude_recently_used: bool,
    pub recent_days: i64,
    pub max_terms_to_return: usize,
}

impl Default for OptimizationOptions {
    fn default() -> Self {
        Self {
            min_efficiency: 0.0,
            min_success_rate: 0.0,
            preferred_term_length: None,
            exclude_recently_used: false,
            recent_days: 7,
            max_terms_to_return: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermSummary {
    pub term: String,
    pub total_searches: u64,
    pub efficiency: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LengthStats {
    pub term_length: usize,
    pub terms: u64,
    pub total_searches: u64,
    pub total_results: u64,
    pub average_efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_terms: u64,
    pub total_searches: u64,
    pub successful_searches: u64,
    pub failed_searches: u64,
    pub total_results: u64,
    pub overall_success_rate: f64,
    pub average_efficiency: f64,
    pub top_terms: Vec<TermSummary>,
    pub by_length: Vec<LengthStats>,
}

/// Retry policy for analytics writes that hit a write conflict.
#[derive(Debug, Clone, Copy)]
pub struct WriteRetry {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

pub struct SearchSpaceExplorer {
    store: Arc<dyn DurableStore>,
    history: Arc<TermHistory>,
    weights: WeightTable,
    rng: Mutex<StdRng>,
    write_retry: WriteRetry,
}

impl SearchSpaceExplorer {
    pub fn new(
        store: Arc<dyn DurableStore>,
        history: Arc<TermHistory>,
        weights: WeightTable,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            history,
            weights,
            rng: Mutex::new(rng),
            write_retry: WriteRetry::default(),
        }
    }

    /// Build from config: weight overrides, optional seed, history interval.
    pub fn from_config(
        store: Arc<dyn DurableStore>,
        config: &ExplorerConfig,
    ) -> Result<Self, ExplorerError> {
        let weights = WeightTable::with_overrides(&config.weights)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::rng().random()),
        };
        let history = Arc::new(TermHistory::new(
            Arc::clone(&store),
            Duration::from_secs(config.history_refresh_secs),
        ));
        Ok(Self::new(store, history, weights, rng))
    }

    pub fn with_write_retry(mut self, write_retry: WriteRetry) -> Self {
        self.write_retry = write_retry;
        self
    }

    pub fn history(&self) -> &Arc<TermHistory> {
        &self.history
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    pub fn starter_terms(&self) -> Vec<String> {
        STARTER_TERMS.iter().map(|t| t.to_string()).collect()
    }

    pub async fn is_database_empty(&self) -> StoreResult<bool> {
        Ok(self.store.analytics_count().await? == 0)
    }

    /// Up to `size` gated terms, marked issued on acceptance.
    pub async fn generate_batch(&self, size: usize) -> StoreResult<Vec<SearchTerm>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        self.history.refresh_if_due().await;

        if self.is_database_empty().await? {
            let batch = self.starter_batch(size).await;
            info!("Cold start: {} starter term(s)", batch.len());
            return Ok(batch);
        }

        let max_attempts = size.saturating_mul(ATTEMPTS_PER_TERM);
        let mut rng = self.rng.lock().await;
        let weights = &self.weights;

        let (batch, attempts) = self
            .history
            .with_issued(|issued| {
                let mut batch = Vec::with_capacity(size);
                let mut attempts = 0;
                while batch.len() < size && attempts < max_attempts {
                    attempts += 1;
                    let Some(strategy) = weights.sample(&mut *rng) else {
                        break;
                    };
                    let text = strategy.generate(&mut *rng);
                    match issued.admit(&text) {
                        Ok(()) => batch.push(SearchTerm {
                            text,
                            strategy: Some(strategy),
                        }),
                        Err(reason) => debug!("Rejected {:?} ({}): {}", text, strategy, reason),
                    }
                }
                (batch, attempts)
            })
            .await;

        if batch.len() < size {
            warn!(
                "Generated {} of {} terms after {} attempts",
                batch.len(),
                size,
                attempts
            );
        } else {
            debug!("Generated {} terms in {} attempts", batch.len(), attempts);
        }
        Ok(batch)
    }

    /// Un-issue terms that were generated but never queued.
    pub async fn release(&self, terms: &[String]) {
        if terms.is_empty() {
            return;
        }
        self.history
            .with_issued(|issued| {
                for term in terms {
                    issued.remove(term);
                }
            })
            .await;
        debug!("Released {} unqueued term(s)", terms.len());
    }

    async fn starter_batch(&self, size: usize) -> Vec<SearchTerm> {
        self.history
            .with_issued(|issued| {
                STARTER_TERMS
                    .iter()
                    .filter(|term| issued.admit(term).is_ok())
                    .take(size)
                    .map(|term| SearchTerm {
                        text: term.to_string(),
                        strategy: None,
                    })
                    .collect()
            })
            .await
    }

    /// Analytics records passing `options`, best efficiency first.
    pub async fn optimized_terms(
        &self,
        options: &OptimizationOptions,
    ) -> StoreResult<Vec<AnalyticsRecord>> {
        let records = self.store.all_analytics().await?;
        Ok(rank_terms(records, options, Utc::now()))
    }

    /// Fold one search outcome into the ledger.
    pub async fn update_analytics(
        &self,
        term: &str,
        result_count: u64,
        success: bool,
    ) -> StoreResult<()> {
        let update = AnalyticsUpdate::new(term, result_count, success);
        self.upsert_with_retry(&update, None).await?;
        self.history.mark_used(term).await;
        Ok(())
    }

    /// Like [`update_analytics`](Self::update_analytics), applied at most
    /// once per key. Returns whether this call applied it.
    pub async fn record_job_outcome(
        &self,
        key: &OutcomeKey,
        term: &str,
        result_count: u64,
        success: bool,
    ) -> StoreResult<bool> {
        let update = AnalyticsUpdate::new(term, result_count, success);
        let applied = self.upsert_with_retry(&update, Some(key)).await?;
        if !applied {
            debug!(
                "Outcome for job {} attempt {} already recorded",
                key.job_id, key.attempt
            );
        }
        self.history.mark_used(term).await;
        Ok(applied)
    }

    async fn upsert_with_retry(
        &self,
        update: &AnalyticsUpdate,
        key: Option<&OutcomeKey>,
    ) -> StoreResult<bool> {
        let mut attempt = 0;
        loop {
            match self.store.upsert_analytics(update, key).await {
                Err(StoreError::WriteConflict(reason)) if attempt + 1 < self.write_retry.attempts => {
                    let delay = self.write_retry.base_delay * 2u32.saturating_pow(attempt);
                    debug!(
                        "Analytics write conflict for {:?} ({}), retrying in {:?}",
                        update.term, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn performance_stats(&self) -> StoreResult<PerformanceStats> {
        let records = self.store.all_analytics().await?;
        Ok(summarize(&records))
    }
}

/// Filter and rank analytics records.
pub fn rank_terms(
    records: Vec<AnalyticsRecord>,
    options: &OptimizationOptions,
    now: DateTime<Utc>,
) -> Vec<AnalyticsRecord> {
    let recent_cutoff = chrono::Duration::try_days(options.recent_days.max(0))
        .and_then(|days| now.checked_sub_signed(days))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut ranked: Vec<AnalyticsRecord> = records
        .into_iter()
        .filter(|r| r.efficiency() >= options.min_efficiency)
        .filter(|r| r.success_rate() >= options.min_success_rate)
        .filter(|r| {
            options
                .preferred_term_length
                .map_or(true, |len| r.term_length == len)
        })
        .filter(|r| !options.exclude_recently_used || r.last_searched < recent_cutoff)
        .collect();

    ranked.sort_by(|a, b| b.efficiency().total_cmp(&a.efficiency()));
    ranked.truncate(options.max_terms_to_return);
    ranked
}

fn summarize(records: &[AnalyticsRecord]) -> PerformanceStats {
    let total_searches: u64 = records.iter().map(|r| r.total_searches).sum();
    let successful_searches: u64 = records.iter().map(|r| r.successful_searches).sum();
    let failed_searches: u64 = records.iter().map(|r| r.failed_searches).sum();
    let total_results: u64 = records.iter().map(|r| r.total_results).sum();

    let searched: Vec<&AnalyticsRecord> = records.iter().filter(|r| r.total_searches > 0).collect();
    let average_efficiency = if searched.is_empty() {
        0.0
    } else {
        searched.iter().map(|r| r.efficiency()).sum::<f64>() / searched.len() as f64
    };
    let overall_success_rate = if total_searches == 0 {
        0.0
    } else {
        successful_searches as f64 / total_searches as f64
    };

    let mut by_efficiency = searched.clone();
    by_efficiency.sort_by(|a, b| b.efficiency().total_cmp(&a.efficiency()));
    let top_terms = by_efficiency
        .iter()
        .take(TOP_TERMS)
        .map(|r| TermSummary {
            term: r.term.clone(),
            total_searches: r.total_searches,
            efficiency: r.efficiency(),
            success_rate: r.success_rate(),
        })
        .collect();

    let mut lengths: BTreeMap<usize, (u64, u64, u64, f64)> = BTreeMap::new();
    for r in &searched {
        let entry = lengths.entry(r.term_length).or_default();
        entry.0 += 1;
        entry.1 += r.total_searches;
        entry.2 += r.total_results;
        entry.3 += r.efficiency();
    }
    let by_length = lengths
        .into_iter()
        .map(|(term_length, (terms, searches, results, efficiency_sum))| LengthStats {
            term_length,
            terms,
            total_searches: searches,
            total_results: results,
            average_efficiency: efficiency_sum / terms as f64,
        })
        .collect();

    PerformanceStats {
        total_terms: records.len() as u64,
        total_searches,
        successful_searches,
        failed_searches,
        total_results,
        overall_success_rate,
        average_efficiency,
        top_terms,
        by_length,
    }
}
