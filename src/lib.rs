//! coverscrape - exhaustive-coverage scrape orchestrator.
//!
//! Harvests a search-only data source by generating search terms, keeping the
//! work queue free of redundant jobs, and keeping an expiring bearer token
//! fresh while workers run.

pub mod config;
pub mod credentials;
pub mod executor;
pub mod explorer;
pub mod humanize;
pub mod orchestrator;
pub mod repository;
pub mod work_queue;
