//! Diesel-backed store for persistent, multi-process operation.
//!
//! Analytics upserts run inside `BEGIN IMMEDIATE` so the outcome-key check and
//! the counter update commit together. Lock contention surfaces as
//! `StoreError::WriteConflict` for the caller to retry.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use diesel_async::{RunQueryDsl, SimpleAsyncConnection};
use tracing::{debug, info};

use super::models::{AnalyticsRecord, AnalyticsUpdate, OutcomeKey, ScrapeJobRecord};
use super::pool::{SqliteConn, SqlitePool};
use super::schema::{applied_outcomes, scrape_jobs, search_term_analytics, SCHEMA_SQL};
use super::{DurableStore, StoreResult};

/// Analytics row from the database.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = search_term_analytics)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct AnalyticsRow {
    term: String,
    term_length: i32,
    total_searches: i64,
    successful_searches: i64,
    failed_searches: i64,
    total_results: i64,
    max_results: i64,
    min_results: i64,
    last_searched: String,
}

impl From<AnalyticsRow> for AnalyticsRecord {
    fn from(row: AnalyticsRow) -> Self {
        Self {
            term: row.term,
            term_length: row.term_length.max(0) as usize,
            total_searches: row.total_searches.max(0) as u64,
            successful_searches: row.successful_searches.max(0) as u64,
            failed_searches: row.failed_searches.max(0) as u64,
            total_results: row.total_results.max(0) as u64,
            max_results: row.max_results.max(0) as u64,
            min_results: row.min_results.max(0) as u64,
            last_searched: parse_datetime(&row.last_searched),
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = scrape_jobs)]
struct NewScrapeJob<'a> {
    job_id: &'a str,
    search_term: &'a str,
    result_count: i64,
    records_saved: i64,
    completed_at: &'a str,
}

#[derive(QueryableByName)]
struct TotalRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

const UPSERT_ANALYTICS_SQL: &str = r#"
    INSERT INTO search_term_analytics (
        term, term_length, total_searches, successful_searches, failed_searches,
        total_results, max_results, min_results, last_searched
    ) VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(term) DO UPDATE SET
        total_searches = total_searches + 1,
        successful_searches = successful_searches + excluded.successful_searches,
        failed_searches = failed_searches + excluded.failed_searches,
        total_results = total_results + excluded.total_results,
        max_results = MAX(max_results, excluded.max_results),
        min_results = MIN(min_results, excluded.min_results),
        last_searched = MAX(last_searched, excluded.last_searched)
"#;

/// SQLite store.
#[derive(Clone)]
pub struct DieselStore {
    pool: SqlitePool,
}

impl DieselStore {
    /// Create a store with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create from a SQLite file path.
    pub fn from_sqlite_path(path: &std::path::Path) -> Self {
        Self::new(SqlitePool::from_path(path))
    }

    /// Open a store and make sure its tables exist.
    pub async fn open(database_url: &str) -> StoreResult<Self> {
        let store = Self::new(SqlitePool::new(database_url));
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if missing.
    pub async fn init_schema(&self) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        for statement in SCHEMA_SQL {
            conn.batch_execute(statement).await?;
        }
        info!("Store schema ready at {}", self.pool.database_url());
        Ok(())
    }

    async fn apply_upsert(
        conn: &mut SqliteConn,
        update: &AnalyticsUpdate,
        key: Option<&OutcomeKey>,
    ) -> StoreResult<bool> {
        let now = Utc::now().to_rfc3339();

        if let Some(key) = key {
            let attempt = i32::try_from(key.attempt).unwrap_or(i32::MAX);
            let inserted = diesel::insert_or_ignore_into(applied_outcomes::table)
                .values((
                    applied_outcomes::job_id.eq(&key.job_id),
                    applied_outcomes::attempt.eq(attempt),
                    applied_outcomes::applied_at.eq(&now),
                ))
                .execute(conn)
                .await?;
            if inserted == 0 {
                debug!(
                    "Outcome for job {} attempt {} already applied",
                    key.job_id, key.attempt
                );
                return Ok(false);
            }
        }

        let term_length = i32::try_from(update.term.chars().count()).unwrap_or(i32::MAX);
        let count = to_i64(update.result_count);
        let searched_at = update.searched_at.to_rfc3339();

        diesel::sql_query(UPSERT_ANALYTICS_SQL)
            .bind::<Text, _>(&update.term)
            .bind::<Integer, _>(term_length)
            .bind::<BigInt, _>(i64::from(update.success))
            .bind::<BigInt, _>(i64::from(!update.success))
            .bind::<BigInt, _>(count)
            .bind::<BigInt, _>(count)
            .bind::<BigInt, _>(count)
            .bind::<Text, _>(&searched_at)
            .execute(conn)
            .await?;

        Ok(true)
    }
}

#[async_trait]
impl DurableStore for DieselStore {
    async fn upsert_analytics(
        &self,
        update: &AnalyticsUpdate,
        key: Option<&OutcomeKey>,
    ) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        conn.batch_execute("BEGIN IMMEDIATE").await?;

        match Self::apply_upsert(&mut conn, update, key).await {
            Ok(applied) => {
                conn.batch_execute("COMMIT").await?;
                Ok(applied)
            }
            Err(e) => {
                // Rollback failure is secondary; report the original error.
                let _ = conn.batch_execute("ROLLBACK").await;
                Err(e)
            }
        }
    }

    async fn get_analytics(&self, term: &str) -> StoreResult<Option<AnalyticsRecord>> {
        let mut conn = self.pool.get().await?;
        let row = search_term_analytics::table
            .find(term)
            .select(AnalyticsRow::as_select())
            .first::<AnalyticsRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(AnalyticsRecord::from))
    }

    async fn all_analytics(&self) -> StoreResult<Vec<AnalyticsRecord>> {
        let mut conn = self.pool.get().await?;
        let rows = search_term_analytics::table
            .select(AnalyticsRow::as_select())
            .load::<AnalyticsRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(AnalyticsRecord::from).collect())
    }

    async fn analytics_count(&self) -> StoreResult<u64> {
        let mut conn = self.pool.get().await?;
        let count: i64 = search_term_analytics::table
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn completed_terms(&self) -> StoreResult<HashSet<String>> {
        let mut conn = self.pool.get().await?;
        let terms: Vec<String> = scrape_jobs::table
            .select(scrape_jobs::search_term)
            .distinct()
            .load(&mut conn)
            .await?;
        Ok(terms.into_iter().collect())
    }

    async fn record_completion(&self, record: &ScrapeJobRecord) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let completed_at = record.completed_at.to_rfc3339();
        let inserted = diesel::insert_or_ignore_into(scrape_jobs::table)
            .values(NewScrapeJob {
                job_id: &record.job_id,
                search_term: &record.term,
                result_count: to_i64(record.result_count),
                records_saved: to_i64(record.records_saved),
                completed_at: &completed_at,
            })
            .execute(&mut conn)
            .await?;
        Ok(inserted > 0)
    }

    async fn harvested_count(&self) -> StoreResult<u64> {
        let mut conn = self.pool.get().await?;
        let row: TotalRow = diesel::sql_query(
            "SELECT CAST(COALESCE(SUM(records_saved), 0) AS BIGINT) AS total FROM scrape_jobs",
        )
        .get_result(&mut conn)
        .await?;
        Ok(row.total.max(0) as u64)
    }
}
