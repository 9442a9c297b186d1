//! In-memory queue backend for single-process operation.
//!
//! Lock-based and not persisted across restarts. Stalled active jobs (held
//! longer than the lock duration) are handed out again, which gives the same
//! at-least-once behavior a persistent broker would. Only the most recent
//! finished jobs are retained; the completed and failed tallies keep counting.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{FailOutcome, Job, JobCounts, JobOptions, JobState, QueueError, WorkQueueBackend};

/// Internal bookkeeping for a job.
#[derive(Debug)]
struct Entry {
    job: Job,
    /// Insertion order, used as the FIFO tie-break.
    seq: u64,
    /// When a delayed job becomes waiting.
    ready_at: Option<Instant>,
    /// When the current attempt was claimed.
    claimed_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    /// Finished job ids, oldest first.
    finished: VecDeque<String>,
    completed_total: u64,
    failed_total: u64,
}

impl QueueState {
    /// Record a terminal transition and evict finished jobs past `retention`.
    fn finish(&mut self, id: &str, state: JobState, retention: usize) {
        match state {
            JobState::Completed => self.completed_total += 1,
            JobState::Failed => self.failed_total += 1,
            _ => return,
        }
        self.finished.push_back(id.to_string());
        while self.finished.len() > retention {
            let Some(evicted) = self.finished.pop_front() else {
                break;
            };
            let terminal = self
                .entries
                .get(&evicted)
                .is_some_and(|e| matches!(e.job.state, JobState::Completed | JobState::Failed));
            if terminal {
                self.entries.remove(&evicted);
            }
        }
    }

    /// Move due delayed jobs to waiting and stalled active jobs back to waiting.
    fn promote(&mut self, now: Instant, lock_duration: Duration) {
        for entry in self.entries.values_mut() {
            match entry.job.state {
                JobState::Delayed => {
                    if entry.ready_at.map_or(true, |t| t <= now) {
                        entry.job.state = JobState::Waiting;
                        entry.ready_at = None;
                    }
                }
                JobState::Active => {
                    if entry
                        .claimed_at
                        .is_some_and(|t| now.duration_since(t) >= lock_duration)
                    {
                        warn!(
                            "Job {} ({}) stalled, returning it to the queue",
                            entry.job.id, entry.job.term
                        );
                        entry.job.state = JobState::Waiting;
                        entry.claimed_at = None;
                    }
                }
                _ => {}
            }
        }
    }

    fn sorted(&self, state: JobState) -> Vec<Job> {
        let mut entries: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.job.state == state)
            .collect();
        entries.sort_by_key(|e| (e.job.effective_priority(), e.seq));
        entries.into_iter().map(|e| e.job.clone()).collect()
    }
}

/// Finished jobs kept for inspection by default.
pub const DEFAULT_RETENTION: usize = 1_000;

/// In-memory work queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<RwLock<QueueState>>,
    lock_duration: Duration,
    retention: usize,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    /// Create a queue with a 5 minute lock duration.
    pub fn new() -> Self {
        Self::with_lock_duration(Duration::from_secs(300))
    }

    /// Create a queue with a custom lock duration for active jobs.
    pub fn with_lock_duration(lock_duration: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(QueueState::default())),
            lock_duration,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Keep at most `retention` finished jobs.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Jobs currently held, finished ones included.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }
}

#[async_trait]
impl WorkQueueBackend for InMemoryQueue {
    async fn add(&self, term: &str, options: JobOptions) -> Result<String, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let (state, ready_at) = match options.delay {
            Some(delay) if !delay.is_zero() => (JobState::Delayed, Some(now + delay)),
            _ => (JobState::Waiting, None),
        };

        let job = Job {
            id: id.clone(),
            term: term.to_string(),
            priority: options.priority,
            attempts_made: 0,
            state,
            options,
            created_at: Utc::now(),
            last_error: None,
        };

        let mut queue = self.state.write().await;
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.insert(
            id.clone(),
            Entry {
                job,
                seq,
                ready_at,
                claimed_at: None,
            },
        );
        debug!("Queued job {} for term {:?}", id, term);
        Ok(id)
    }

    async fn waiting(&self) -> Result<Vec<Job>, QueueError> {
        let mut queue = self.state.write().await;
        queue.promote(Instant::now(), self.lock_duration);
        Ok(queue.sorted(JobState::Waiting))
    }

    async fn delayed(&self) -> Result<Vec<Job>, QueueError> {
        let mut queue = self.state.write().await;
        queue.promote(Instant::now(), self.lock_duration);
        Ok(queue.sorted(JobState::Delayed))
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let queue = self.state.read().await;
        Ok(queue.entries.get(id).map(|e| e.job.clone()))
    }

    async fn remove(&self, id: &str) -> Result<(), QueueError> {
        let mut queue = self.state.write().await;
        match queue.entries.get(id) {
            None => Err(QueueError::NotFound(id.to_string())),
            Some(entry) if entry.job.state == JobState::Active => {
                Err(QueueError::Locked(id.to_string()))
            }
            Some(_) => {
                queue.entries.remove(id);
                Ok(())
            }
        }
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut queue = self.state.write().await;
        queue.promote(Instant::now(), self.lock_duration);
        let mut counts = JobCounts {
            completed: queue.completed_total,
            failed: queue.failed_total,
            ..Default::default()
        };
        for entry in queue.entries.values() {
            match entry.job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed | JobState::Failed => {}
            }
        }
        Ok(counts)
    }

    async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let now = Instant::now();
        let mut queue = self.state.write().await;
        queue.promote(now, self.lock_duration);

        let next_id = queue
            .entries
            .values()
            .filter(|e| e.job.state == JobState::Waiting)
            .min_by_key(|e| (e.job.effective_priority(), e.seq))
            .map(|e| e.job.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };
        let Some(entry) = queue.entries.get_mut(&id) else {
            return Ok(None);
        };
        entry.job.state = JobState::Active;
        entry.job.attempts_made += 1;
        entry.claimed_at = Some(now);
        Ok(Some(entry.job.clone()))
    }

    async fn complete(&self, id: &str) -> Result<(), QueueError> {
        let mut queue = self.state.write().await;
        let entry = queue
            .entries
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if entry.job.state == JobState::Completed {
            return Ok(());
        }
        entry.job.state = JobState::Completed;
        entry.claimed_at = None;
        queue.finish(id, JobState::Completed, self.retention);
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str) -> Result<FailOutcome, QueueError> {
        let mut queue = self.state.write().await;
        let entry = queue
            .entries
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        entry.job.last_error = Some(error.to_string());
        entry.claimed_at = None;

        if entry.job.attempts_made >= entry.job.options.attempts {
            entry.job.state = JobState::Failed;
            queue.finish(id, JobState::Failed, self.retention);
            return Ok(FailOutcome::Failed);
        }

        let retry_in = entry.job.options.backoff.delay_for(entry.job.attempts_made);
        entry.job.state = JobState::Delayed;
        entry.ready_at = Some(Instant::now() + retry_in);
        Ok(FailOutcome::Retrying { retry_in })
    }

    async fn failed(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let queue = self.state.read().await;
        Ok(queue
            .finished
            .iter()
            .rev()
            .filter_map(|id| queue.entries.get(id))
            .filter(|e| e.job.state == JobState::Failed)
            .take(limit)
            .map(|e| e.job.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_queue::Backoff;

    fn opts(priority: Option<u32>) -> JobOptions {
        JobOptions {
            priority,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_fifo() {
        let queue = InMemoryQueue::new();
        queue.add("low", opts(Some(20))).await.unwrap();
        queue.add("default-a", opts(None)).await.unwrap();
        queue.add("high", opts(Some(1))).await.unwrap();
        queue.add("default-b", opts(Some(10))).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.claim_next().await.unwrap() {
            order.push(job.term);
        }
        assert_eq!(order, vec!["high", "default-a", "default-b", "low"]);
    }

    #[tokio::test]
    async fn test_failed_attempt_moves_to_delayed_then_fails() {
        let queue = InMemoryQueue::new();
        let options = JobOptions {
            attempts: 2,
            backoff: Backoff::Fixed { delay_ms: 0 },
            ..Default::default()
        };
        let id = queue.add("Oak", options).await.unwrap();

        let job = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        let outcome = queue.fail(&id, "timeout").await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                retry_in: Duration::ZERO
            }
        );

        // Zero backoff: promoted straight back to waiting.
        let job = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        assert_eq!(queue.fail(&id, "timeout").await.unwrap(), FailOutcome::Failed);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimable_until_ready() {
        let queue = InMemoryQueue::new();
        queue
            .add(
                "later",
                JobOptions {
                    delay: Some(Duration::from_secs(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.delayed().await.unwrap().len(), 1);
        assert!(queue.waiting().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_active_job_is_locked() {
        let queue = InMemoryQueue::new();
        let id = queue.add("Oak", opts(None)).await.unwrap();
        queue.claim_next().await.unwrap();

        assert!(matches!(
            queue.remove(&id).await,
            Err(QueueError::Locked(_))
        ));
        assert!(matches!(
            queue.remove("missing").await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_finished_jobs_are_evicted_past_retention() {
        let queue = InMemoryQueue::new().with_retention(100);
        for i in 0..1_000 {
            let id = queue.add(&format!("term-{}", i), opts(None)).await.unwrap();
            queue.claim_next().await.unwrap();
            queue.complete(&id).await.unwrap();
        }

        assert_eq!(queue.len().await, 100);
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1_000);
        assert_eq!(counts.in_flight(), 0);

        // The newest finished jobs are the ones kept.
        let newest = queue.state.read().await.finished.back().cloned().unwrap();
        assert_eq!(
            queue.get(&newest).await.unwrap().unwrap().term,
            "term-999"
        );
    }

    #[tokio::test]
    async fn test_eviction_keeps_pending_jobs() {
        let queue = InMemoryQueue::new().with_retention(0);
        let pending = queue.add("later", opts(None)).await.unwrap();
        let done = queue.add("now", opts(Some(1))).await.unwrap();
        queue.claim_next().await.unwrap();
        queue.complete(&done).await.unwrap();

        assert!(queue.get(&done).await.unwrap().is_none());
        assert!(queue.get(&pending).await.unwrap().is_some());
        assert_eq!(queue.counts().await.unwrap().completed, 1);
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_failed_lists_most_recent_first() {
        let queue = InMemoryQueue::new();
        let single = JobOptions {
            attempts: 1,
            ..Default::default()
        };
        for term in ["Oak", "Elm", "Ash"] {
            let id = queue.add(term, single.clone()).await.unwrap();
            queue.claim_next().await.unwrap();
            queue.fail(&id, "timeout").await.unwrap();
        }
        let ok = queue.add("Pine", opts(None)).await.unwrap();
        queue.claim_next().await.unwrap();
        queue.complete(&ok).await.unwrap();

        let failed: Vec<String> = queue
            .failed(2)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.term)
            .collect();
        assert_eq!(failed, vec!["Ash", "Elm"]);
        assert_eq!(queue.counts().await.unwrap().failed, 3);
    }

    #[tokio::test]
    async fn test_stalled_job_is_redelivered() {
        let queue = InMemoryQueue::with_lock_duration(Duration::ZERO);
        queue.add("Oak", opts(None)).await.unwrap();

        let first = queue.claim_next().await.unwrap().unwrap();
        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts_made, 2);
    }
}
