//! Work queue abstraction for scrape jobs.
//!
//! A job carries one search term. The lifecycle is
//! `delayed -> waiting -> active -> {completed | failed}`; a failed attempt
//! with attempts left goes back to `delayed` for its backoff period.
//!
//! Backends provide at-least-once delivery: a job whose worker dies is handed
//! out again, so everything downstream of a job must tolerate redelivery.
//!
//! Backends:
//! - SQLite via Diesel (persistent, shared between processes)
//! - In-memory (tests and single-process dry runs)

mod db_jobs;
pub mod dedup;
mod error;
mod memory;
pub mod worker;

pub use db_jobs::DbJobQueue;
pub use dedup::{AdmissionResult, DedupOptions, DedupResult, QueueDedupController, RetryOptions};
pub use error::QueueError;
pub use memory::InMemoryQueue;
pub use worker::{WorkerPool, WorkerPoolConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority used when a job carries none. Lower numbers run first.
pub const DEFAULT_PRIORITY: u32 = 10;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Delayed,
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        Self::Delayed,
        Self::Waiting,
        Self::Active,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delayed => "delayed",
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Pending jobs are the ones dedup is allowed to touch.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }
}

/// Retry backoff policy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay every retry.
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempt - 1)`, capped at one hour.
    Exponential { delay_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential { delay_ms: 5_000 }
    }
}

impl Backoff {
    /// Delay before the retry that follows `attempts_made` failed attempts.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        const MAX_MS: u64 = 3_600_000;
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms.min(MAX_MS)),
            Self::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1).min(20);
                let ms = delay_ms.saturating_mul(2u64.saturating_pow(exp));
                Duration::from_millis(ms.min(MAX_MS))
            }
        }
    }
}

/// Options attached to a job when it is added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower runs first. `None` is treated as [`DEFAULT_PRIORITY`].
    pub priority: Option<u32>,
    /// Total attempts before the job is marked failed.
    pub attempts: u32,
    pub backoff: Backoff,
    /// Hold the job in `delayed` for this long before it becomes waiting.
    pub delay: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: None,
            attempts: 3,
            backoff: Backoff::default(),
            delay: None,
        }
    }
}

/// A scrape job bound to one search term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub term: String,
    pub priority: Option<u32>,
    /// Attempts started so far (1 while the first attempt is active).
    pub attempts_made: u32,
    pub state: JobState,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn effective_priority(&self) -> u32 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }
}

/// Job counts by state. `completed` and `failed` count every job that
/// reached that state, including ones no longer retained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    /// Depth used for admission backpressure.
    pub fn in_flight(&self) -> u64 {
        self.waiting + self.active
    }
}

/// What happened to a job reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Moved to `delayed`; it will run again after the backoff.
    Retrying { retry_in: Duration },
    /// No attempts left.
    Failed,
}

/// Queue backend contract.
///
/// Admission and inspection (`add`, `waiting`, `delayed`, `get`, `remove`,
/// `counts`) are used by the orchestrator and the dedup controller. The
/// claim lifecycle (`claim_next`, `complete`, `fail`) is used by workers.
#[async_trait]
pub trait WorkQueueBackend: Send + Sync {
    /// Add a job and return its id.
    async fn add(&self, term: &str, options: JobOptions) -> Result<String, QueueError>;

    /// Jobs ready to run, in dispatch order.
    async fn waiting(&self) -> Result<Vec<Job>, QueueError>;

    /// Jobs held back by a delay or a retry backoff.
    async fn delayed(&self) -> Result<Vec<Job>, QueueError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// Remove a pending or finished job. Active jobs are locked.
    async fn remove(&self, id: &str) -> Result<(), QueueError>;

    async fn counts(&self) -> Result<JobCounts, QueueError>;

    /// Claim the next job for processing, moving it to `active`.
    async fn claim_next(&self) -> Result<Option<Job>, QueueError>;

    /// Mark an active job as completed.
    async fn complete(&self, id: &str) -> Result<(), QueueError>;

    /// Report a failed attempt of an active job.
    async fn fail(&self, id: &str, error: &str) -> Result<FailOutcome, QueueError>;

    /// Up to `limit` jobs that ran out of attempts, most recent first.
    async fn failed(&self, limit: usize) -> Result<Vec<Job>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential { delay_ms: 1_000 };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = Backoff::Exponential { delay_ms: 60_000 };
        assert_eq!(backoff.delay_for(30), Duration::from_secs(3_600));
        let fixed = Backoff::Fixed {
            delay_ms: u64::MAX,
        };
        assert_eq!(fixed.delay_for(1), Duration::from_secs(3_600));
    }

    #[test]
    fn test_pending_states() {
        assert!(JobState::Waiting.is_pending());
        assert!(JobState::Delayed.is_pending());
        assert!(!JobState::Active.is_pending());
        assert!(!JobState::Completed.is_pending());
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in JobState::ALL {
            assert_eq!(JobState::from_name(state.as_str()), Some(state));
        }
        assert_eq!(JobState::from_name("paused"), None);
    }

    #[test]
    fn test_in_flight_counts_waiting_and_active() {
        let counts = JobCounts {
            waiting: 3,
            active: 2,
            delayed: 9,
            completed: 100,
            failed: 1,
        };
        assert_eq!(counts.in_flight(), 5);
    }
}
