//! Config discovery, parsing, environment overrides and validation.

use std::path::Path;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use super::Config;
use crate::credentials::schedule::RefreshSchedule;
use crate::explorer::Strategy;

pub const ENV_TOKEN: &str = "SOURCE_BEARER_TOKEN";
pub const ENV_BROWSER_URL: &str = "BROWSER_URL";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_COVERAGE_TARGET: &str = "COVERAGE_TARGET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("Failed to parse {format} config: {reason}")]
    Parse { format: &'static str, reason: String },
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl Config {
    /// Discover a `coverscrape` config file in the standard locations, falling
    /// back to defaults. Environment overrides are applied either way.
    pub async fn load() -> Result<Self, ConfigError> {
        let config = match prefer::load("coverscrape").await {
            Ok(found) => match found.source_path() {
                Some(path) => Self::load_from_path(path).await?,
                None => Self::default(),
            },
            Err(_) => {
                debug!("No config file discovered, using defaults");
                Self::default()
            }
        };
        config.with_env_overrides()
    }

    /// Load from an explicit path; format follows the extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let mut config = Self::parse(&contents, ext)?;
        config.source_path = Some(path.to_path_buf());
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse config text in the format named by `ext`.
    pub fn parse(contents: &str, ext: &str) -> Result<Self, ConfigError> {
        match ext {
            "toml" => toml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "TOML",
                reason: e.to_string(),
            }),
            "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "YAML",
                reason: e.to_string(),
            }),
            _ => serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "JSON",
                reason: e.to_string(),
            }),
        }
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get(ENV_TOKEN) {
            self.credentials.initial_token = Some(token);
        }
        if let Some(url) = get(ENV_BROWSER_URL) {
            self.browser.remote_url = Some(url);
        }
        if let Some(url) = get(ENV_DATABASE_URL) {
            self.database_url = Some(url);
        }
        if let Some(target) = get(ENV_COVERAGE_TARGET) {
            self.orchestrator.coverage_target = target
                .trim()
                .parse()
                .map_err(|_| invalid("COVERAGE_TARGET", format!("not a number: {:?}", target)))?;
        }
        Ok(self)
    }

    /// Check values that would otherwise fail deep inside a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.batch_size == 0 {
            return Err(invalid("orchestrator.batch_size", "must be at least 1"));
        }
        if self.workers.concurrency == 0 {
            return Err(invalid("workers.concurrency", "must be at least 1"));
        }
        if self.workers.max_delay_ms < self.workers.min_delay_ms {
            warn!("workers.max_delay_ms is below min_delay_ms; using min_delay_ms");
        }
        if self.source.page_size == 0 {
            return Err(invalid("source.page_size", "must be at least 1"));
        }
        if self.queue.lock_duration_secs == 0 {
            return Err(invalid("queue.lock_duration_secs", "must be at least 1"));
        }

        RefreshSchedule::parse(&self.credentials.refresh_schedule)
            .map_err(|e| invalid("credentials.refresh_schedule", e.to_string()))?;

        check_url("source.search_url", &self.source.search_url)?;
        check_url("browser.target_url", &self.browser.target_url)?;
        Regex::new(&self.browser.request_url_pattern)
            .map_err(|e| invalid("browser.request_url_pattern", e.to_string()))?;

        let opt = &self.explorer.optimization;
        check_non_negative("explorer.optimization.min_efficiency", opt.min_efficiency)?;
        check_non_negative("explorer.optimization.min_success_rate", opt.min_success_rate)?;
        if opt.min_success_rate > 1.0 {
            return Err(invalid(
                "explorer.optimization.min_success_rate",
                "must be between 0 and 1",
            ));
        }
        for (name, weight) in &self.explorer.weights {
            if Strategy::from_name(name).is_none() {
                return Err(invalid("explorer.weights", format!("unknown strategy '{}'", name)));
            }
            check_non_negative("explorer.weights", *weight)?;
        }
        Ok(())
    }
}

/// Empty means "not configured"; anything else must parse.
fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Ok(());
    }
    let url = url::Url::parse(value).map_err(|e| invalid(field, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(field, format!("unsupported scheme '{}'", other))),
    }
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < 0.0 {
        return Err(invalid(field, format!("must be non-negative, got {}", value)));
    }
    Ok(())
}
