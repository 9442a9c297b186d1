//! Shared wiring for CLI commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use console::style;

use coverscrape::config::{Config, QueueBackendKind};
use coverscrape::credentials::{
    CredentialCapturer, CredentialManager, CredentialOptions, DisabledCapturer, TokenValidator,
};
use coverscrape::explorer::SearchSpaceExplorer;
use coverscrape::repository::{DieselStore, DurableStore};
use coverscrape::work_queue::{DbJobQueue, InMemoryQueue, WorkQueueBackend};

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Open the SQLite store, creating its directory and schema if needed.
pub async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn DurableStore>> {
    let path = config.database_path();
    ensure_parent_dir(&path).await?;
    let store = DieselStore::from_sqlite_path(&path);
    store.init_schema().await?;
    Ok(Arc::new(store))
}

/// Open the configured queue backend. The SQLite queue shares the store's file.
pub async fn open_queue(config: &Config) -> anyhow::Result<Arc<dyn WorkQueueBackend>> {
    match config.queue.backend {
        QueueBackendKind::Sqlite => {
            let path = config.database_path();
            ensure_parent_dir(&path).await?;
            let queue = DbJobQueue::open(&path, config.queue.lock_duration())
                .await
                .with_context(|| format!("opening queue in {}", path.display()))?;
            Ok(Arc::new(queue))
        }
        QueueBackendKind::Memory => Ok(Arc::new(
            InMemoryQueue::with_lock_duration(config.queue.lock_duration())
                .with_retention(config.queue.memory_retention),
        )),
    }
}

pub fn build_explorer(
    config: &Config,
    store: Arc<dyn DurableStore>,
) -> anyhow::Result<Arc<SearchSpaceExplorer>> {
    Ok(Arc::new(SearchSpaceExplorer::from_config(store, &config.explorer)?))
}

/// Browser capturer when a target page is configured and the `browser`
/// feature is built in; otherwise a capturer that always reports unavailable.
pub fn build_capturer(config: &Config) -> Arc<dyn CredentialCapturer> {
    if !config.credentials.browser_refresh {
        return Arc::new(DisabledCapturer::new("browser refresh disabled in config"));
    }
    if config.browser.target_url.is_empty() {
        return Arc::new(DisabledCapturer::new("browser.target_url is not configured"));
    }

    let validator = TokenValidator::new(
        config.credentials.min_token_length,
        config.credentials.token_prefix.clone(),
    );

    #[cfg(feature = "browser")]
    {
        use coverscrape::credentials::browser::BrowserCapturer;
        match BrowserCapturer::new(config.browser.clone(), validator) {
            Ok(capturer) => Arc::new(capturer),
            Err(e) => Arc::new(DisabledCapturer::new(e.to_string())),
        }
    }

    #[cfg(not(feature = "browser"))]
    {
        let _ = validator;
        Arc::new(DisabledCapturer::new(
            "built without the browser feature; rebuild with --features browser",
        ))
    }
}

pub fn build_credentials(config: &Config) -> Arc<CredentialManager> {
    let capturer = build_capturer(config);
    Arc::new(CredentialManager::new(
        capturer,
        CredentialOptions::from(&config.credentials),
    ))
}

/// Print a labelled line in the style used by every command.
pub fn print_kv(label: &str, value: impl std::fmt::Display) {
    println!("  {:<22} {}", style(label).dim(), value);
}
