//! Queue deduplication and admission control.
//!
//! Keeps the pending set (`waiting` + `delayed`) to at most one job per
//! search term, always the one with the lowest priority number, and keeps
//! jobs for terms that already have a completion record out of it.
//!
//! Every removal is independent: a failed removal is counted and logged and
//! the pass moves on. Nothing here returns an error to the caller; failures
//! become counts in [`DedupResult`].

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use tracing::{debug, info, warn};

use super::{Job, JobOptions, QueueError, WorkQueueBackend};
use crate::repository::DurableStore;

/// Maximum duplicate-group terms listed in verbose output.
const DUPLICATE_PREVIEW_LIMIT: usize = 10;
/// Maximum completed-term entries listed in verbose output.
const COMPLETED_PREVIEW_LIMIT: usize = 20;
/// Progress line cadence, in successful removals.
const PROGRESS_EVERY: usize = 10;

/// Output flags for a dedup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupOptions {
    /// Preview affected terms.
    pub verbose: bool,
    /// Print a progress line every ten removals on large passes.
    pub show_progress: bool,
}

/// Combined outcome of both dedup passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupResult {
    pub removed: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for DedupResult {
    fn add_assign(&mut self, other: Self) {
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

/// Outcome of admitting a batch of terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionResult {
    pub queued: usize,
    /// Already pending, already completed, or repeated within the batch.
    pub skipped: usize,
    /// Terms the queue refused to add.
    pub failed: Vec<String>,
}

/// How failed jobs are put back on the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Failed jobs to look at, most recent first.
    pub limit: usize,
    /// Pause between submissions.
    pub pace: Duration,
    pub job: JobOptions,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            pace: Duration::from_secs(6),
            job: JobOptions::default(),
        }
    }
}

/// A term's pending jobs, sorted so the keeper comes first.
struct DuplicateGroup {
    term: String,
    jobs: Vec<Job>,
}

/// Removes redundant pending jobs and gates admission of new ones.
pub struct QueueDedupController {
    queue: Arc<dyn WorkQueueBackend>,
    store: Arc<dyn DurableStore>,
}

impl QueueDedupController {
    pub fn new(queue: Arc<dyn WorkQueueBackend>, store: Arc<dyn DurableStore>) -> Self {
        Self { queue, store }
    }

    /// Run both passes, printing to stdout.
    pub async fn remove_duplicates_from_queue(&self, options: DedupOptions) -> DedupResult {
        let mut stdout = std::io::stdout();
        self.remove_duplicates_with_output(options, &mut stdout)
            .await
    }

    /// Run both passes, writing user-facing output to `out`.
    pub async fn remove_duplicates_with_output<W: Write + Send>(
        &self,
        options: DedupOptions,
        out: &mut W,
    ) -> DedupResult {
        let mut result = self.remove_duplicate_pending(options, out).await;
        result += self.remove_already_completed(options, out).await;

        let _ = writeln!(
            out,
            "{} Dedup finished: removed {} job(s), {} failed",
            style("✓").green(),
            result.removed,
            result.failed
        );
        info!(
            "Queue dedup removed {} job(s), {} removal(s) failed",
            result.removed, result.failed
        );
        result
    }

    /// Enqueue the terms that have no pending job and no completion record.
    pub async fn admit(
        &self,
        terms: &[String],
        options: &JobOptions,
    ) -> Result<AdmissionResult, QueueError> {
        let mut blocked: HashSet<String> = self
            .pending_jobs()
            .await?
            .into_iter()
            .map(|job| job.term)
            .collect();

        match self.store.completed_terms().await {
            Ok(completed) => blocked.extend(completed),
            Err(e) => warn!("Could not load completed terms for admission: {}", e),
        }

        let mut result = AdmissionResult::default();
        for term in terms {
            if !blocked.insert(term.clone()) {
                result.skipped += 1;
                continue;
            }
            match self.queue.add(term, options.clone()).await {
                Ok(id) => {
                    debug!("Admitted {:?} as job {}", term, id);
                    result.queued += 1;
                }
                Err(e) => {
                    warn!("Failed to queue {:?}: {}", term, e);
                    blocked.remove(term);
                    result.failed.push(term.clone());
                }
            }
        }
        Ok(result)
    }

    /// Re-admit the unique terms of recently failed jobs, one at a time.
    ///
    /// Each term goes through [`Self::admit`], so terms that are pending again
    /// or completed since are skipped.
    pub async fn retry_failed<W: Write + Send>(
        &self,
        options: &RetryOptions,
        out: &mut W,
    ) -> Result<AdmissionResult, QueueError> {
        let failed = self.queue.failed(options.limit).await?;
        let mut seen = HashSet::new();
        let terms: Vec<String> = failed
            .into_iter()
            .map(|job| job.term)
            .filter(|term| seen.insert(term.clone()))
            .collect();

        let total = terms.len();
        let _ = writeln!(
            out,
            "Re-queueing {} unique failed search term(s), {}ms apart",
            total,
            options.pace.as_millis()
        );

        let mut result = AdmissionResult::default();
        for (i, term) in terms.iter().enumerate() {
            if i > 0 && !options.pace.is_zero() {
                tokio::time::sleep(options.pace).await;
            }
            let n = i + 1;
            match self.admit(std::slice::from_ref(term), &options.job).await {
                Ok(admitted) if admitted.queued > 0 => {
                    let _ = writeln!(out, "{}/{} {} Queued: {:?}", n, total, style("✓").green(), term);
                    result.queued += 1;
                }
                Ok(admitted) if admitted.skipped > 0 => {
                    let _ = writeln!(
                        out,
                        "{}/{} {} Skipped: {:?} is pending or completed",
                        n,
                        total,
                        style("-").dim(),
                        term
                    );
                    result.skipped += 1;
                }
                Ok(_) => {
                    let _ = writeln!(out, "{}/{} {} Failed: {:?}", n, total, style("✗").red(), term);
                    result.failed.push(term.clone());
                }
                Err(e) => {
                    let _ = writeln!(
                        out,
                        "{}/{} {} Error: {:?} - {}",
                        n,
                        total,
                        style("✗").red(),
                        term,
                        e
                    );
                    result.failed.push(term.clone());
                }
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "{} Queued: {}", style("✓").green(), result.queued);
        let _ = writeln!(out, "{} Failed to queue: {}", style("✗").red(), result.failed.len());
        info!(
            "Retry of failed jobs queued {}, skipped {}, failed {}",
            result.queued,
            result.skipped,
            result.failed.len()
        );
        Ok(result)
    }

    /// All `waiting` and `delayed` jobs.
    async fn pending_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs = self.queue.waiting().await?;
        jobs.extend(self.queue.delayed().await?);
        Ok(jobs)
    }

    /// Pass 1: keep one job per term, the lowest priority number.
    async fn remove_duplicate_pending<W: Write + Send>(
        &self,
        options: DedupOptions,
        out: &mut W,
    ) -> DedupResult {
        let pending = match self.pending_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Could not list pending jobs: {}", e);
                let _ = writeln!(out, "{} Could not list pending jobs: {}", style("✗").red(), e);
                return DedupResult::default();
            }
        };

        let groups = group_duplicates(pending);
        if groups.is_empty() {
            let _ = writeln!(out, "{} No duplicate pending jobs", style("✓").green());
            return DedupResult::default();
        }

        let to_remove: Vec<&Job> = groups.iter().flat_map(|g| g.jobs.iter().skip(1)).collect();
        let _ = writeln!(
            out,
            "{} Found {} duplicate term group(s) ({} job(s) to remove)",
            style("→").cyan(),
            groups.len(),
            to_remove.len()
        );

        if options.verbose {
            for group in groups.iter().take(DUPLICATE_PREVIEW_LIMIT) {
                let _ = writeln!(
                    out,
                    "  {:?}: {} jobs, keeping priority {}",
                    group.term,
                    group.jobs.len(),
                    group.jobs[0].effective_priority()
                );
            }
            if groups.len() > DUPLICATE_PREVIEW_LIMIT {
                let _ = writeln!(
                    out,
                    "  ... and {} more",
                    groups.len() - DUPLICATE_PREVIEW_LIMIT
                );
            }
        }

        self.remove_jobs(&to_remove, options, out).await
    }

    /// Pass 2: drop every pending job whose term already completed.
    async fn remove_already_completed<W: Write + Send>(
        &self,
        options: DedupOptions,
        out: &mut W,
    ) -> DedupResult {
        let completed = match self.store.completed_terms().await {
            Ok(terms) => terms,
            Err(e) => {
                warn!("Could not load completed terms: {}", e);
                let _ = writeln!(
                    out,
                    "{} Could not load completed terms: {}",
                    style("✗").red(),
                    e
                );
                return DedupResult::default();
            }
        };
        if completed.is_empty() {
            return DedupResult::default();
        }

        let pending = match self.pending_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Could not list pending jobs: {}", e);
                return DedupResult::default();
            }
        };

        let to_remove: Vec<&Job> = pending
            .iter()
            .filter(|job| completed.contains(&job.term))
            .collect();
        if to_remove.is_empty() {
            let _ = writeln!(
                out,
                "{} No pending jobs for completed terms",
                style("✓").green()
            );
            return DedupResult::default();
        }

        // Per-term counts in first-seen order for the preview.
        let mut order: Vec<&str> = Vec::new();
        let mut per_term: HashMap<&str, usize> = HashMap::new();
        for job in &to_remove {
            let count = per_term.entry(job.term.as_str()).or_insert_with(|| {
                order.push(job.term.as_str());
                0
            });
            *count += 1;
        }

        let _ = writeln!(
            out,
            "{} Found {} pending job(s) for {} already-completed term(s)",
            style("→").cyan(),
            to_remove.len(),
            order.len()
        );

        if options.verbose {
            for term in order.iter().take(COMPLETED_PREVIEW_LIMIT) {
                let _ = writeln!(out, "  {:?}: {} pending", term, per_term[term]);
            }
            if order.len() > COMPLETED_PREVIEW_LIMIT {
                let _ = writeln!(
                    out,
                    "  ... and {} more",
                    order.len() - COMPLETED_PREVIEW_LIMIT
                );
            }
        }

        self.remove_jobs(&to_remove, options, out).await
    }

    /// Remove jobs one by one; failures are counted, never propagated.
    async fn remove_jobs<W: Write + Send>(
        &self,
        jobs: &[&Job],
        options: DedupOptions,
        out: &mut W,
    ) -> DedupResult {
        let total = jobs.len();
        let mut result = DedupResult::default();

        for job in jobs {
            match self.queue.remove(&job.id).await {
                Ok(()) => {
                    result.removed += 1;
                    if options.show_progress
                        && total > PROGRESS_EVERY
                        && result.removed % PROGRESS_EVERY == 0
                    {
                        let _ = writeln!(out, "  Progress: {}/{}", result.removed, total);
                    }
                }
                Err(e) => {
                    result.failed += 1;
                    warn!("Failed to remove job {} ({:?}): {}", job.id, job.term, e);
                    if options.verbose {
                        let _ = writeln!(
                            out,
                            "  {} Failed to remove job {} ({:?}): {}",
                            style("✗").red(),
                            job.id,
                            job.term,
                            e
                        );
                    }
                }
            }
        }
        result
    }
}

/// Group pending jobs by term, keeping only groups with more than one job.
///
/// Groups follow first-seen order; within a group jobs are stably sorted by
/// effective priority so equal priorities keep their listing order.
fn group_duplicates(pending: Vec<Job>) -> Vec<DuplicateGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut by_term: HashMap<String, Vec<Job>> = HashMap::new();
    for job in pending {
        if !by_term.contains_key(&job.term) {
            order.push(job.term.clone());
        }
        by_term.entry(job.term.clone()).or_default().push(job);
    }

    order
        .into_iter()
        .filter_map(|term| {
            let mut jobs = by_term.remove(&term)?;
            if jobs.len() < 2 {
                return None;
            }
            jobs.sort_by_key(Job::effective_priority);
            Some(DuplicateGroup { term, jobs })
        })
        .collect()
}
