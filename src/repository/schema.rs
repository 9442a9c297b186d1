// Diesel table definitions for the store.

diesel::table! {
    search_term_analytics (term) {
        term -> Text,
        term_length -> Integer,
        total_searches -> BigInt,
        successful_searches -> BigInt,
        failed_searches -> BigInt,
        total_results -> BigInt,
        max_results -> BigInt,
        min_results -> BigInt,
        last_searched -> Text,
    }
}

diesel::table! {
    applied_outcomes (job_id, attempt) {
        job_id -> Text,
        attempt -> Integer,
        applied_at -> Text,
    }
}

diesel::table! {
    scrape_jobs (job_id) {
        job_id -> Text,
        search_term -> Text,
        result_count -> BigInt,
        records_saved -> BigInt,
        completed_at -> Text,
    }
}

diesel::table! {
    queue_jobs (seq) {
        seq -> BigInt,
        id -> Text,
        term -> Text,
        priority -> Nullable<Integer>,
        attempts_made -> Integer,
        max_attempts -> Integer,
        backoff -> Text,
        state -> Text,
        ready_at -> Nullable<Text>,
        claimed_at -> Nullable<Text>,
        finished_at -> Nullable<Text>,
        created_at -> Text,
        last_error -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    search_term_analytics,
    applied_outcomes,
    scrape_jobs,
    queue_jobs,
);

/// DDL applied by `DieselStore::init_schema`.
pub const SCHEMA_SQL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS search_term_analytics (
        term TEXT PRIMARY KEY NOT NULL,
        term_length INTEGER NOT NULL,
        total_searches BIGINT NOT NULL DEFAULT 0,
        successful_searches BIGINT NOT NULL DEFAULT 0,
        failed_searches BIGINT NOT NULL DEFAULT 0,
        total_results BIGINT NOT NULL DEFAULT 0,
        max_results BIGINT NOT NULL DEFAULT 0,
        min_results BIGINT NOT NULL DEFAULT 0,
        last_searched TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS applied_outcomes (
        job_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        applied_at TEXT NOT NULL,
        PRIMARY KEY (job_id, attempt)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS scrape_jobs (
        job_id TEXT PRIMARY KEY NOT NULL,
        search_term TEXT NOT NULL,
        result_count BIGINT NOT NULL DEFAULT 0,
        records_saved BIGINT NOT NULL DEFAULT 0,
        completed_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_scrape_jobs_term ON scrape_jobs(search_term)",
    "CREATE INDEX IF NOT EXISTS idx_analytics_last_searched ON search_term_analytics(last_searched)",
];

/// DDL applied by `DbJobQueue::init_schema`.
pub const QUEUE_SCHEMA_SQL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS queue_jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        term TEXT NOT NULL,
        priority INTEGER,
        attempts_made INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        backoff TEXT NOT NULL,
        state TEXT NOT NULL,
        ready_at TEXT,
        claimed_at TEXT,
        finished_at TEXT,
        created_at TEXT NOT NULL,
        last_error TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_queue_jobs_state ON queue_jobs(state)",
    "CREATE INDEX IF NOT EXISTS idx_queue_jobs_term ON queue_jobs(term)",
];
