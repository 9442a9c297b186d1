//! Durable storage for term analytics and scrape history.
//!
//! The harvested records themselves live elsewhere; this layer only tracks
//! what the orchestrator needs to steer itself:
//! - per-term performance counters (analytics ledger)
//! - completion records for finished scrape jobs
//!
//! Backends:
//! - In-memory (tests and dry runs, not persisted)
//! - SQLite via Diesel (persistent, multi-process with busy retry)

mod memory;
mod models;
pub mod pool;
pub(crate) mod schema;
mod sqlite;

pub use memory::InMemoryStore;
pub use models::{AnalyticsRecord, AnalyticsUpdate, OutcomeKey, ScrapeJobRecord};
pub use sqlite::DieselStore;

use std::collections::HashSet;

use async_trait::async_trait;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from durable store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    /// Another writer holds the lock. Callers retry the write.
    #[error("Write conflict: {0}")]
    WriteConflict(String),
    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        let message = e.to_string();
        if is_busy_message(&message) {
            StoreError::WriteConflict(message)
        } else {
            StoreError::Database(message)
        }
    }
}

/// SQLite reports lock contention as "database is locked" / "database table is locked".
pub(crate) fn is_busy_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("database is locked") || lower.contains("is locked") || lower.contains("busy")
}

/// Storage consumed by the explorer, the dedup controller and the workers.
///
/// Implementations must be safe for concurrent use from many tasks.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Create or accumulate an analytics record.
    ///
    /// When `key` is set, the update is applied at most once per key and the
    /// return value tells whether it was applied (`false` for a redelivery).
    async fn upsert_analytics(
        &self,
        update: &AnalyticsUpdate,
        key: Option<&OutcomeKey>,
    ) -> StoreResult<bool>;

    /// Fetch the analytics record for a term.
    async fn get_analytics(&self, term: &str) -> StoreResult<Option<AnalyticsRecord>>;

    /// All analytics records.
    async fn all_analytics(&self) -> StoreResult<Vec<AnalyticsRecord>>;

    /// Number of distinct terms in the ledger.
    async fn analytics_count(&self) -> StoreResult<u64>;

    /// Terms with at least one completion record.
    async fn completed_terms(&self) -> StoreResult<HashSet<String>>;

    /// Create a completion record. Unique per job id; returns `false` when
    /// the job already has one.
    async fn record_completion(&self, record: &ScrapeJobRecord) -> StoreResult<bool>;

    /// Total harvested records across all completion records.
    async fn harvested_count(&self) -> StoreResult<u64>;
}
