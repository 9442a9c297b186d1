//! Database-backed work queue on the store's SQLite file.
//!
//! Jobs survive restarts and can be shared by several processes. Claims and
//! failure reports run inside `BEGIN IMMEDIATE` so two workers never claim the
//! same row. Delayed jobs are promoted and stalled claims reclaimed lazily, on
//! every read that looks at pending work.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use diesel_async::{RunQueryDsl, SimpleAsyncConnection};
use tracing::{debug, info, warn};

use super::{
    Backoff, FailOutcome, Job, JobCounts, JobOptions, JobState, QueueError, WorkQueueBackend,
    DEFAULT_PRIORITY,
};
use crate::repository::pool::{SqliteConn, SqlitePool};
use crate::repository::schema::{queue_jobs, QUEUE_SCHEMA_SQL};

#[derive(Queryable, Selectable, QueryableByName, Debug, Clone)]
#[diesel(table_name = queue_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct JobRow {
    seq: i64,
    id: String,
    term: String,
    priority: Option<i32>,
    attempts_made: i32,
    max_attempts: i32,
    backoff: String,
    state: String,
    #[allow(dead_code)]
    ready_at: Option<String>,
    #[allow(dead_code)]
    claimed_at: Option<String>,
    #[allow(dead_code)]
    finished_at: Option<String>,
    created_at: String,
    last_error: Option<String>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        let backoff: Backoff = serde_json::from_str(&row.backoff).unwrap_or_default();
        let priority = row.priority.map(|p| p.max(0) as u32);
        Self {
            id: row.id,
            term: row.term,
            priority,
            attempts_made: row.attempts_made.max(0) as u32,
            state: JobState::from_name(&row.state).unwrap_or(JobState::Waiting),
            options: JobOptions {
                priority,
                attempts: row.max_attempts.max(0) as u32,
                backoff,
                delay: None,
            },
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            last_error: row.last_error,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = queue_jobs)]
struct NewJobRow<'a> {
    id: &'a str,
    term: &'a str,
    priority: Option<i32>,
    attempts_made: i32,
    max_attempts: i32,
    backoff: String,
    state: &'a str,
    ready_at: Option<String>,
    created_at: String,
}

#[derive(QueryableByName)]
struct StateCount {
    #[diesel(sql_type = Text)]
    state: String,
    #[diesel(sql_type = BigInt)]
    n: i64,
}

/// Fixed-width UTC timestamp, so text comparison orders by time.
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// Commit on success, roll back on error.
async fn finish_tx<T>(
    conn: &mut SqliteConn,
    result: Result<T, QueueError>,
) -> Result<T, QueueError> {
    match result {
        Ok(value) => {
            conn.batch_execute("COMMIT").await?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.batch_execute("ROLLBACK").await;
            Err(e)
        }
    }
}

/// SQLite work queue.
#[derive(Clone)]
pub struct DbJobQueue {
    pool: SqlitePool,
    lock_duration: Duration,
}

impl DbJobQueue {
    pub fn new(pool: SqlitePool, lock_duration: Duration) -> Self {
        Self {
            pool,
            lock_duration,
        }
    }

    /// Open a queue on a SQLite file and make sure its table exists.
    pub async fn open(path: &std::path::Path, lock_duration: Duration) -> Result<Self, QueueError> {
        let queue = Self::new(SqlitePool::from_path(path), lock_duration);
        queue.init_schema().await?;
        Ok(queue)
    }

    pub async fn init_schema(&self) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        for statement in QUEUE_SCHEMA_SQL {
            conn.batch_execute(statement).await?;
        }
        info!("Queue schema ready at {}", self.pool.database_url());
        Ok(())
    }

    /// Make due delayed jobs waiting and return stalled claims to waiting.
    async fn promote(&self, conn: &mut SqliteConn) -> Result<(), QueueError> {
        let now = Utc::now();
        diesel::update(
            queue_jobs::table
                .filter(queue_jobs::state.eq(JobState::Delayed.as_str()))
                .filter(queue_jobs::ready_at.le(stamp(now))),
        )
        .set((
            queue_jobs::state.eq(JobState::Waiting.as_str()),
            queue_jobs::ready_at.eq(None::<String>),
        ))
        .execute(conn)
        .await?;

        let stalled = diesel::update(
            queue_jobs::table
                .filter(queue_jobs::state.eq(JobState::Active.as_str()))
                .filter(queue_jobs::claimed_at.le(stamp(before(now, self.lock_duration)))),
        )
        .set((
            queue_jobs::state.eq(JobState::Waiting.as_str()),
            queue_jobs::claimed_at.eq(None::<String>),
        ))
        .execute(conn)
        .await?;
        if stalled > 0 {
            warn!("{} stalled job(s) returned to the queue", stalled);
        }
        Ok(())
    }

    /// Jobs in `state`, in dispatch order.
    async fn list(&self, state: JobState) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.pool.get().await?;
        self.promote(&mut conn).await?;
        let rows: Vec<JobRow> = diesel::sql_query(format!(
            "SELECT * FROM queue_jobs WHERE state = ? ORDER BY COALESCE(priority, {}), seq",
            DEFAULT_PRIORITY
        ))
        .bind::<Text, _>(state.as_str())
        .load(&mut conn)
        .await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn find(conn: &mut SqliteConn, id: &str) -> Result<Option<JobRow>, QueueError> {
        Ok(queue_jobs::table
            .filter(queue_jobs::id.eq(id))
            .select(JobRow::as_select())
            .first::<JobRow>(conn)
            .await
            .optional()?)
    }

    async fn claim_in(&self, conn: &mut SqliteConn) -> Result<Option<Job>, QueueError> {
        self.promote(conn).await?;
        let next: Option<JobRow> = diesel::sql_query(format!(
            "SELECT * FROM queue_jobs WHERE state = ? ORDER BY COALESCE(priority, {}), seq LIMIT 1",
            DEFAULT_PRIORITY
        ))
        .bind::<Text, _>(JobState::Waiting.as_str())
        .get_result(conn)
        .await
        .optional()?;

        let Some(mut row) = next else {
            return Ok(None);
        };
        row.attempts_made += 1;
        row.state = JobState::Active.as_str().to_string();
        diesel::update(queue_jobs::table.find(row.seq))
            .set((
                queue_jobs::state.eq(&row.state),
                queue_jobs::attempts_made.eq(row.attempts_made),
                queue_jobs::claimed_at.eq(Some(stamp(Utc::now()))),
            ))
            .execute(conn)
            .await?;
        Ok(Some(Job::from(row)))
    }

    async fn fail_in(
        &self,
        conn: &mut SqliteConn,
        id: &str,
        error: &str,
    ) -> Result<FailOutcome, QueueError> {
        let row = Self::find(conn, id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let job = Job::from(row);
        let now = Utc::now();

        if job.attempts_made >= job.options.attempts {
            diesel::update(queue_jobs::table.filter(queue_jobs::id.eq(id)))
                .set((
                    queue_jobs::state.eq(JobState::Failed.as_str()),
                    queue_jobs::claimed_at.eq(None::<String>),
                    queue_jobs::finished_at.eq(Some(stamp(now))),
                    queue_jobs::last_error.eq(Some(error)),
                ))
                .execute(conn)
                .await?;
            return Ok(FailOutcome::Failed);
        }

        let retry_in = job.options.backoff.delay_for(job.attempts_made);
        diesel::update(queue_jobs::table.filter(queue_jobs::id.eq(id)))
            .set((
                queue_jobs::state.eq(JobState::Delayed.as_str()),
                queue_jobs::claimed_at.eq(None::<String>),
                queue_jobs::ready_at.eq(Some(stamp(after(now, retry_in)))),
                queue_jobs::last_error.eq(Some(error)),
            ))
            .execute(conn)
            .await?;
        Ok(FailOutcome::Retrying { retry_in })
    }
}

#[async_trait]
impl WorkQueueBackend for DbJobQueue {
    async fn add(&self, term: &str, options: JobOptions) -> Result<String, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let (state, ready_at) = match options.delay {
            Some(delay) if !delay.is_zero() => (JobState::Delayed, Some(stamp(after(now, delay)))),
            _ => (JobState::Waiting, None),
        };
        let backoff = serde_json::to_string(&options.backoff)
            .map_err(|e| QueueError::Other(format!("encode backoff: {}", e)))?;

        let mut conn = self.pool.get().await?;
        diesel::insert_into(queue_jobs::table)
            .values(NewJobRow {
                id: &id,
                term,
                priority: options.priority.map(to_i32),
                attempts_made: 0,
                max_attempts: to_i32(options.attempts),
                backoff,
                state: state.as_str(),
                ready_at,
                created_at: stamp(now),
            })
            .execute(&mut conn)
            .await?;
        debug!("Queued job {} for term {:?}", id, term);
        Ok(id)
    }

    async fn waiting(&self) -> Result<Vec<Job>, QueueError> {
        self.list(JobState::Waiting).await
    }

    async fn delayed(&self) -> Result<Vec<Job>, QueueError> {
        self.list(JobState::Delayed).await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.pool.get().await?;
        Ok(Self::find(&mut conn, id).await?.map(Job::from))
    }

    async fn remove(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        let deleted = diesel::delete(
            queue_jobs::table
                .filter(queue_jobs::id.eq(id))
                .filter(queue_jobs::state.ne(JobState::Active.as_str())),
        )
        .execute(&mut conn)
        .await?;
        if deleted > 0 {
            return Ok(());
        }
        match Self::find(&mut conn, id).await? {
            Some(_) => Err(QueueError::Locked(id.to_string())),
            None => Err(QueueError::NotFound(id.to_string())),
        }
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut conn = self.pool.get().await?;
        self.promote(&mut conn).await?;
        let rows: Vec<StateCount> =
            diesel::sql_query("SELECT state, COUNT(*) AS n FROM queue_jobs GROUP BY state")
                .load(&mut conn)
                .await?;

        let mut counts = JobCounts::default();
        for row in rows {
            let n = row.n.max(0) as u64;
            match JobState::from_name(&row.state) {
                Some(JobState::Waiting) => counts.waiting = n,
                Some(JobState::Active) => counts.active = n,
                Some(JobState::Delayed) => counts.delayed = n,
                Some(JobState::Completed) => counts.completed = n,
                Some(JobState::Failed) => counts.failed = n,
                None => warn!("Ignoring {} job(s) in unknown state {:?}", n, row.state),
            }
        }
        Ok(counts)
    }

    async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let mut conn = self.pool.get().await?;
        conn.batch_execute("BEGIN IMMEDIATE").await?;
        let result = self.claim_in(&mut conn).await;
        finish_tx(&mut conn, result).await
    }

    async fn complete(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(queue_jobs::table.filter(queue_jobs::id.eq(id)))
            .set((
                queue_jobs::state.eq(JobState::Completed.as_str()),
                queue_jobs::claimed_at.eq(None::<String>),
                queue_jobs::finished_at.eq(Some(stamp(Utc::now()))),
            ))
            .execute(&mut conn)
            .await?;
        if updated == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str) -> Result<FailOutcome, QueueError> {
        let mut conn = self.pool.get().await?;
        conn.batch_execute("BEGIN IMMEDIATE").await?;
        let result = self.fail_in(&mut conn, id, error).await;
        finish_tx(&mut conn, result).await
    }

    async fn failed(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.pool.get().await?;
        let rows = queue_jobs::table
            .filter(queue_jobs::state.eq(JobState::Failed.as_str()))
            .order((queue_jobs::finished_at.desc(), queue_jobs::seq.desc()))
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .select(JobRow::as_select())
            .load::<JobRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup(lock: Duration) -> (tempfile::TempDir, DbJobQueue) {
        let dir = tempdir().unwrap();
        let queue = DbJobQueue::open(&dir.path().join("queue.db"), lock)
            .await
            .unwrap();
        (dir, queue)
    }

    fn opts(priority: Option<u32>) -> JobOptions {
        JobOptions {
            priority,
            ..Default::default()
        }
    }

    fn single_attempt() -> JobOptions {
        JobOptions {
            attempts: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_fifo() {
        let (_dir, queue) = setup(Duration::from_secs(300)).await;
        queue.add("low", opts(Some(20))).await.unwrap();
        queue.add("default-a", opts(None)).await.unwrap();
        queue.add("high", opts(Some(1))).await.unwrap();
        queue.add("default-b", opts(Some(10))).await.unwrap();

        let waiting: Vec<String> = queue
            .waiting()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.term)
            .collect();
        assert_eq!(waiting, vec!["high", "default-a", "default-b", "low"]);

        let mut order = Vec::new();
        while let Some(job) = queue.claim_next().await.unwrap() {
            assert_eq!(job.state, JobState::Active);
            assert_eq!(job.attempts_made, 1);
            order.push(job.term);
        }
        assert_eq!(order, waiting);
        assert_eq!(queue.counts().await.unwrap().active, 4);
    }

    #[tokio::test]
    async fn test_retry_then_fail_keeps_attempts_and_error() {
        let (_dir, queue) = setup(Duration::from_secs(300)).await;
        let options = JobOptions {
            attempts: 2,
            backoff: Backoff::Fixed { delay_ms: 0 },
            ..Default::default()
        };
        let id = queue.add("Oak", options).await.unwrap();

        queue.claim_next().await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&id, "timeout").await.unwrap(),
            FailOutcome::Retrying {
                retry_in: Duration::ZERO
            }
        );

        let job = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.options.backoff, Backoff::Fixed { delay_ms: 0 });
        assert_eq!(queue.fail(&id, "HTTP 503").await.unwrap(), FailOutcome::Failed);

        let failed = queue.failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("HTTP 503"));
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_delayed_job_waits_for_its_delay() {
        let (_dir, queue) = setup(Duration::from_secs(300)).await;
        queue
            .add(
                "later",
                JobOptions {
                    delay: Some(Duration::from_secs(600)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        queue
            .add(
                "soon",
                JobOptions {
                    delay: Some(Duration::from_millis(20)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.delayed().await.unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let job = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(job.term, "soon");
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stalled_claim_is_redelivered() {
        let (_dir, queue) = setup(Duration::ZERO).await;
        queue.add("Oak", opts(None)).await.unwrap();

        let first = queue.claim_next().await.unwrap().unwrap();
        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_remove_rules() {
        let (_dir, queue) = setup(Duration::from_secs(300)).await;
        let active = queue.add("Oak", opts(Some(1))).await.unwrap();
        let pending = queue.add("Elm", opts(None)).await.unwrap();
        queue.claim_next().await.unwrap();

        assert!(matches!(
            queue.remove(&active).await,
            Err(QueueError::Locked(_))
        ));
        queue.remove(&pending).await.unwrap();
        assert!(queue.get(&pending).await.unwrap().is_none());
        assert!(matches!(
            queue.remove(&pending).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let lock = Duration::from_secs(300);
        {
            let queue = DbJobQueue::open(&path, lock).await.unwrap();
            queue.add("Oak", opts(Some(3))).await.unwrap();
            let done = queue.add("Elm", opts(Some(1))).await.unwrap();
            queue.claim_next().await.unwrap();
            queue.complete(&done).await.unwrap();
        }

        let queue = DbJobQueue::open(&path, lock).await.unwrap();
        let waiting = queue.waiting().await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].term, "Oak");
        assert_eq!(waiting[0].priority, Some(3));
        assert_eq!(queue.counts().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_failed_lists_most_recent_first() {
        let (_dir, queue) = setup(Duration::from_secs(300)).await;
        for term in ["Oak", "Elm", "Ash"] {
            let id = queue.add(term, single_attempt()).await.unwrap();
            queue.claim_next().await.unwrap();
            queue.fail(&id, "timeout").await.unwrap();
        }

        let terms: Vec<String> = queue
            .failed(2)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.term)
            .collect();
        assert_eq!(terms, vec!["Ash", "Elm"]);
    }

    #[tokio::test]
    async fn test_unknown_job_errors() {
        let (_dir, queue) = setup(Duration::from_secs(300)).await;
        assert!(matches!(
            queue.complete("missing").await,
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            queue.fail("missing", "x").await,
            Err(QueueError::NotFound(_))
        ));
        assert!(queue.get("missing").await.unwrap().is_none());
    }
}
