//! Store models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-term performance ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub term: String,
    pub term_length: usize,
    pub total_searches: u64,
    pub successful_searches: u64,
    pub failed_searches: u64,
    pub total_results: u64,
    pub max_results: u64,
    pub min_results: u64,
    pub last_searched: DateTime<Utc>,
}

impl AnalyticsRecord {
    /// Build the first record for a term from a single outcome.
    pub fn from_update(update: &AnalyticsUpdate) -> Self {
        Self {
            term: update.term.clone(),
            term_length: update.term.chars().count(),
            total_searches: 1,
            successful_searches: u64::from(update.success),
            failed_searches: u64::from(!update.success),
            total_results: update.result_count,
            max_results: update.result_count,
            min_results: update.result_count,
            last_searched: update.searched_at,
        }
    }

    /// Accumulate another outcome into this record.
    pub fn apply(&mut self, update: &AnalyticsUpdate) {
        self.total_searches += 1;
        if update.success {
            self.successful_searches += 1;
        } else {
            self.failed_searches += 1;
        }
        self.total_results += update.result_count;
        self.max_results = self.max_results.max(update.result_count);
        self.min_results = self.min_results.min(update.result_count);
        if update.searched_at > self.last_searched {
            self.last_searched = update.searched_at;
        }
    }

    /// Fraction of searches that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_searches == 0 {
            return 0.0;
        }
        self.successful_searches as f64 / self.total_searches as f64
    }

    /// Average number of results per search.
    pub fn efficiency(&self) -> f64 {
        if self.total_searches == 0 {
            return 0.0;
        }
        self.total_results as f64 / self.total_searches as f64
    }
}

/// A single search outcome to fold into the ledger.
#[derive(Debug, Clone)]
pub struct AnalyticsUpdate {
    pub term: String,
    pub result_count: u64,
    pub success: bool,
    pub searched_at: DateTime<Utc>,
}

impl AnalyticsUpdate {
    pub fn new(term: impl Into<String>, result_count: u64, success: bool) -> Self {
        Self {
            term: term.into(),
            result_count,
            success,
            searched_at: Utc::now(),
        }
    }
}

/// Identifies one delivery attempt of a job.
///
/// The queue delivers at least once, so a worker can report the same attempt
/// twice after a crash. Keyed writes are applied once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutcomeKey {
    pub job_id: String,
    pub attempt: u32,
}

impl OutcomeKey {
    pub fn new(job_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            job_id: job_id.into(),
            attempt,
        }
    }
}

/// Durable completion record of a scrape job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJobRecord {
    pub job_id: String,
    pub term: String,
    pub result_count: u64,
    pub records_saved: u64,
    pub completed_at: DateTime<Utc>,
}
