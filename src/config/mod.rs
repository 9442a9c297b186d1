//! Configuration for coverscrape.
//!
//! A single [`Config`] document (TOML, YAML or JSON) carries every tunable.
//! Every section has defaults, so an empty file or no file at all is valid;
//! `search_url` and `browser.target_url` are only required by the commands
//! that talk to the source.

mod loader;

pub use loader::{ConfigError, ENV_BROWSER_URL, ENV_COVERAGE_TARGET, ENV_DATABASE_URL, ENV_TOKEN};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::explorer::OptimizationOptions;
use crate::work_queue::{Backoff, JobOptions};

/// Default database filename inside the data directory.
pub const DEFAULT_DATABASE_FILENAME: &str = "coverscrape.db";

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory (supports `~`). Defaults to the platform data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Explicit database URL or path; overrides `data_dir`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub source: SourceConfig,
    pub credentials: CredentialsConfig,
    pub browser: BrowserCaptureConfig,
    pub explorer: ExplorerConfig,
    pub orchestrator: OrchestratorConfig,
    pub workers: WorkerConfig,
    pub dedup: DedupConfig,
    pub queue: QueueConfig,
    /// File this config was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Upstream search endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub search_url: String,
    /// Query parameter carrying the search term.
    pub term_param: String,
    /// Query parameter carrying the page number.
    pub page_param: String,
    pub first_page: u32,
    /// Upstream page-size cap; a shorter page ends pagination.
    pub page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size_param: Option<String>,
    /// Dotted path to the record array in the response (empty = root).
    pub records_field: String,
    /// Dotted path to the reported total, if the source reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_field: Option<String>,
    pub max_pages: u32,
    pub request_timeout_secs: u64,
    /// Fixed user agent; rotated from a built-in list when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            search_url: String::new(),
            term_param: "q".to_string(),
            page_param: "page".to_string(),
            first_page: 1,
            page_size: 100,
            page_size_param: Some("limit".to_string()),
            records_field: "results".to_string(),
            total_field: Some("total".to_string()),
            max_pages: 20,
            request_timeout_secs: 30,
            user_agent: None,
        }
    }
}

/// Bearer credential lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Static token to start with (also `SOURCE_BEARER_TOKEN`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_token: Option<String>,
    /// `*/N * * * *`, `90s`/`4m`/`1h`, or milliseconds.
    pub refresh_schedule: String,
    pub capture_timeout_secs: u64,
    /// A token older than this makes the credential unhealthy.
    pub staleness_secs: u64,
    pub min_token_length: usize,
    /// Required token prefix; empty accepts any.
    pub token_prefix: String,
    /// Refresh through the browser at all.
    pub browser_refresh: bool,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            initial_token: None,
            refresh_schedule: "*/4 * * * *".to_string(),
            capture_timeout_secs: 60,
            staleness_secs: 600,
            min_token_length: 20,
            token_prefix: "eyJ".to_string(),
            browser_refresh: true,
        }
    }
}

impl CredentialsConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

/// Browser session used to capture a fresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserCaptureConfig {
    /// Page that issues authenticated search requests.
    pub target_url: String,
    /// CSS selector of the search input on the target page.
    pub search_input_selector: String,
    /// Term typed into the search input to trigger a request.
    pub search_term: String,
    /// Regex a qualifying API request URL must match.
    pub request_url_pattern: String,
    /// Bounded wait for a qualifying request.
    pub request_wait_secs: u64,
    /// Pause after submitting before inspecting captured traffic.
    pub settle_ms: u64,
    /// localStorage / sessionStorage keys inspected for a token.
    pub storage_keys: Vec<String>,
    /// Cookie names inspected for a token.
    pub cookie_names: Vec<String>,
    pub headless: bool,
    /// Chrome binary; discovered on PATH when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<String>,
    /// Connect to an existing browser (`ws://` or `http://host:9222`) instead of launching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

impl Default for BrowserCaptureConfig {
    fn default() -> Self {
        let keys = ["token", "access_token", "accessToken", "authToken", "id_token"];
        Self {
            target_url: String::new(),
            search_input_selector: "input[type=search]".to_string(),
            search_term: "Main".to_string(),
            request_url_pattern: "/api/".to_string(),
            request_wait_secs: 15,
            settle_ms: 3_000,
            storage_keys: keys.iter().map(|k| k.to_string()).collect(),
            cookie_names: keys.iter().map(|k| k.to_string()).collect(),
            headless: true,
            chrome_path: None,
            remote_url: None,
        }
    }
}

/// Term generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// RNG seed for reproducible batches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// How often the issued-term history is reloaded from the store.
    pub history_refresh_secs: u64,
    /// Strategy weight overrides by strategy name; unset entries keep defaults.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub weights: HashMap<String, f64>,
    /// Analytics thresholds for ranked terms.
    pub optimization: OptimizationOptions,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            seed: None,
            history_refresh_secs: 300,
            weights: HashMap::new(),
            optimization: OptimizationOptions::default(),
        }
    }
}

/// Orchestration loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Stop once the store holds this many records.
    pub coverage_target: u64,
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    /// Admit a new batch only while `waiting + active` is below this.
    pub low_water_mark: u64,
    pub monitor_interval_secs: u64,
    /// Run queue dedup every N cycles; 0 disables.
    pub dedup_every_cycles: u64,
    pub job_attempts: u32,
    pub job_backoff: Backoff,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_priority: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            coverage_target: 100_000,
            batch_size: 50,
            inter_batch_delay_ms: 30_000,
            low_water_mark: 100,
            monitor_interval_secs: 60,
            dedup_every_cycles: 10,
            job_attempts: 3,
            job_backoff: Backoff::default(),
            job_priority: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// Options for every job the loop admits.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            priority: self.job_priority,
            attempts: self.job_attempts,
            backoff: self.job_backoff,
            delay: None,
        }
    }
}

/// Worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Random pause between jobs, lower bound.
    pub min_delay_ms: u64,
    /// Random pause between jobs, upper bound.
    pub max_delay_ms: u64,
    /// Idle poll interval when the queue is empty.
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            min_delay_ms: 1_000,
            max_delay_ms: 4_000,
            poll_interval_ms: 2_000,
        }
    }
}

/// Default flags for queue dedup runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub verbose: bool,
    pub show_progress: bool,
}

/// Where jobs live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendKind {
    /// `queue_jobs` table in the store's database; survives restarts.
    #[default]
    Sqlite,
    /// Process-local; lost on exit.
    Memory,
}

/// Work queue backend and the `retry-failed` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackendKind,
    /// An active job whose worker is silent this long is handed out again.
    pub lock_duration_secs: u64,
    /// Finished jobs the memory backend keeps for inspection.
    pub memory_retention: usize,
    /// Pause between `retry-failed` submissions.
    pub retry_delay_ms: u64,
    /// Failed jobs `retry-failed` looks at.
    pub retry_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::default(),
            lock_duration_secs: 300,
            memory_retention: 1_000,
            retry_delay_ms: 6_000,
            retry_limit: 100,
        }
    }
}

impl QueueConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Config {
    /// Default data directory: platform data dir, then home, then cwd.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("coverscrape")
    }

    /// Directory relative paths resolve against: the config file's parent or cwd.
    pub fn base_dir(&self) -> PathBuf {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve a path that may be relative or start with `~`.
    pub fn resolve_path(&self, path_str: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        match self.data_dir {
            Some(ref dir) => self.resolve_path(dir),
            None => Self::default_data_dir(),
        }
    }

    /// Path of the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        match self.database_url {
            Some(ref url) => {
                let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"));
                self.resolve_path(path.unwrap_or(url))
            }
            None => self.data_dir().join(DEFAULT_DATABASE_FILENAME),
        }
    }

    /// Point the database at `path` (a `.db` file or a directory).
    pub fn set_database_target(&mut self, path: &Path) {
        let is_file = path
            .extension()
            .is_some_and(|ext| ext == "db" || ext == "sqlite" || ext == "sqlite3");
        if is_file {
            self.database_url = Some(path.display().to_string());
        } else {
            self.database_url = None;
            self.data_dir = Some(path.display().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.orchestrator.batch_size, 50);
        assert_eq!(config.orchestrator.dedup_every_cycles, 10);
        assert_eq!(config.credentials.capture_timeout(), Duration::from_secs(60));
        assert_eq!(config.credentials.staleness(), Duration::from_secs(600));
        assert_eq!(config.explorer.history_refresh_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [orchestrator]
            coverage_target = 500
            low_water_mark = 10

            [source]
            search_url = "https://records.example.com/api/search"
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.coverage_target, 500);
        assert_eq!(config.orchestrator.low_water_mark, 10);
        assert_eq!(config.orchestrator.batch_size, 50);
        assert_eq!(config.source.term_param, "q");
    }

    #[test]
    fn test_database_path_resolution() {
        let mut config = Config {
            source_path: Some(PathBuf::from("/etc/coverscrape/config.toml")),
            ..Default::default()
        };
        config.data_dir = Some("data".to_string());
        assert_eq!(
            config.database_path(),
            PathBuf::from("/etc/coverscrape/data").join(DEFAULT_DATABASE_FILENAME)
        );

        config.database_url = Some("sqlite:/var/lib/cs.db".to_string());
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/cs.db"));
    }

    #[test]
    fn test_set_database_target() {
        let mut config = Config::default();
        config.set_database_target(Path::new("/tmp/run/harvest.db"));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/run/harvest.db"));

        config.set_database_target(Path::new("/tmp/run"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/run").join(DEFAULT_DATABASE_FILENAME)
        );
    }

    #[test]
    fn test_queue_section() {
        let config = Config::default();
        assert_eq!(config.queue.backend, QueueBackendKind::Sqlite);
        assert_eq!(config.queue.lock_duration(), Duration::from_secs(300));
        assert_eq!(config.queue.retry_delay(), Duration::from_secs(6));
        assert_eq!(config.queue.retry_limit, 100);

        let config: Config = toml::from_str(
            r#"
            [queue]
            backend = "memory"
            memory_retention = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.backend, QueueBackendKind::Memory);
        assert_eq!(config.queue.memory_retention, 50);
        assert_eq!(config.queue.lock_duration_secs, 300);
    }

    #[test]
    fn test_job_options_follow_config() {
        let config = OrchestratorConfig {
            job_attempts: 5,
            job_backoff: Backoff::Fixed { delay_ms: 250 },
            ..Default::default()
        };
        let options = config.job_options();
        assert_eq!(options.attempts, 5);
        assert_eq!(options.backoff, Backoff::Fixed { delay_ms: 250 });
        assert_eq!(options.priority, None);
    }
}
