//! Bearer credential management.
//!
//! [`CredentialManager`] owns the one live token. Refreshes are single-flight
//! and bounded by a timeout; a failed refresh keeps the previous token. If the
//! browser session cannot be started the manager degrades permanently and
//! refresh calls return the last known token without trying again.

#[cfg(feature = "browser")]
pub mod browser;
pub mod capture;
mod cleanup;
pub mod schedule;

pub use capture::{
    CaptureError, CapturedToken, CredentialCapturer, DisabledCapturer, TokenSource,
    TokenValidator,
};
pub use schedule::{IntervalScheduler, RefreshSchedule, ScheduleError, Scheduler};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CredentialsConfig;

/// The current credential. Replaced as a whole on every successful refresh.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub token: Option<String>,
    pub source: Option<TokenSource>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub refresh_count: u64,
    pub failure_count: u64,
    /// Cleared permanently once the capture session cannot start.
    pub browser_refresh_enabled: bool,
    /// Started from a static token.
    pub seeded: bool,
}

/// Construction options for [`CredentialManager`].
#[derive(Debug, Clone)]
pub struct CredentialOptions {
    pub initial_token: Option<String>,
    pub capture_timeout: Duration,
    /// Age after which a refreshed token counts as stale.
    pub staleness: Duration,
    pub browser_refresh: bool,
}

impl Default for CredentialOptions {
    fn default() -> Self {
        Self {
            initial_token: None,
            capture_timeout: Duration::from_secs(60),
            staleness: Duration::from_secs(600),
            browser_refresh: true,
        }
    }
}

impl From<&CredentialsConfig> for CredentialOptions {
    fn from(config: &CredentialsConfig) -> Self {
        Self {
            initial_token: config.initial_token.clone(),
            capture_timeout: config.capture_timeout(),
            staleness: config.staleness(),
            browser_refresh: config.browser_refresh,
        }
    }
}

/// Read-only view of the credential. The token is masked.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
    pub has_token: bool,
    pub token_preview: Option<String>,
    pub source: Option<TokenSource>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub refresh_count: u64,
    pub failure_count: u64,
    pub browser_refresh_enabled: bool,
    pub refreshing: bool,
    pub auto_refresh_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialHealth {
    pub healthy: bool,
    pub has_token: bool,
    pub token_age_secs: Option<i64>,
    pub stale: bool,
    pub degraded: bool,
    pub failure_rate: String,
}

struct AutoRefresh {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Clears the single-flight flag on every exit path, including cancellation.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CredentialManager {
    state: RwLock<Credential>,
    refreshing: AtomicBool,
    capturer: Arc<dyn CredentialCapturer>,
    capture_timeout: Duration,
    staleness: Duration,
    auto_refresh: Mutex<Option<AutoRefresh>>,
}

impl CredentialManager {
    pub fn new(capturer: Arc<dyn CredentialCapturer>, options: CredentialOptions) -> Self {
        let seed = options
            .initial_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let seeded = seed.is_some();
        if seeded {
            info!("Credential seeded from static token");
        }

        let credential = Credential {
            source: seed.as_ref().map(|_| TokenSource::Env),
            token: seed,
            browser_refresh_enabled: options.browser_refresh,
            seeded,
            ..Default::default()
        };

        Self {
            state: RwLock::new(credential),
            refreshing: AtomicBool::new(false),
            capturer,
            capture_timeout: options.capture_timeout,
            staleness: options.staleness,
            auto_refresh: Mutex::new(None),
        }
    }

    pub async fn current_token(&self) -> Option<String> {
        self.state.read().await.token.clone()
    }

    /// Snapshot of the full credential.
    pub async fn credential(&self) -> Credential {
        self.state.read().await.clone()
    }

    /// Capture a new token, returning whichever token is current afterwards.
    ///
    /// Never fails: errors and timeouts are counted and logged and the
    /// previous token is returned. A call made while another refresh is in
    /// flight returns the current token immediately.
    pub async fn refresh_token(&self) -> Option<String> {
        if !self.state.read().await.browser_refresh_enabled {
            debug!("Browser refresh disabled, keeping current token");
            return self.current_token().await;
        }

        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Refresh already in flight");
            return self.current_token().await;
        }
        let _guard = RefreshGuard(&self.refreshing);

        let outcome = tokio::time::timeout(self.capture_timeout, self.capturer.capture()).await;

        let mut state = self.state.write().await;
        match outcome {
            Ok(Ok(captured)) => {
                info!(
                    "Captured fresh token from {} (refresh #{})",
                    captured.source,
                    state.refresh_count + 1
                );
                state.token = Some(captured.token);
                state.source = Some(captured.source);
                state.last_refresh = Some(Utc::now());
                state.refresh_count += 1;
            }
            Ok(Err(e)) if e.is_unavailable() => {
                state.failure_count += 1;
                state.browser_refresh_enabled = false;
                error!("{}; browser refresh disabled for this run", e);
            }
            Ok(Err(e)) => {
                state.failure_count += 1;
                warn!("Token refresh failed: {}", e);
            }
            Err(_) => {
                state.failure_count += 1;
                warn!("{}", CaptureError::Timeout(self.capture_timeout));
            }
        }
        state.token.clone()
    }

    /// Refresh on a parsed schedule.
    pub async fn start_auto_refresh(self: &Arc<Self>, schedule: &RefreshSchedule) -> bool {
        info!("Starting auto refresh every {:?}", schedule.period());
        self.start_auto_refresh_with(Arc::new(schedule.scheduler()))
            .await
    }

    /// Refresh every `interval_ms` with jitter.
    pub async fn start_auto_refresh_interval(self: &Arc<Self>, interval_ms: u64) -> bool {
        info!("Starting auto refresh every {} ms", interval_ms);
        self.start_auto_refresh_with(Arc::new(IntervalScheduler::from_millis(interval_ms)))
            .await
    }

    /// Refresh once now, then on every tick of `scheduler` while not degraded.
    ///
    /// Returns false (and does nothing) if auto refresh is already running.
    pub async fn start_auto_refresh_with(self: &Arc<Self>, scheduler: Arc<dyn Scheduler>) -> bool {
        let mut slot = self.auto_refresh.lock().await;
        if slot.as_ref().is_some_and(|a| !a.handle.is_finished()) {
            warn!("Auto refresh already running");
            return false;
        }

        let (stop, mut stopped) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.refresh_token().await;
            loop {
                if !manager.state.read().await.browser_refresh_enabled {
                    info!("Auto refresh ending: browser refresh disabled");
                    break;
                }
                let delay = scheduler.next_delay();
                debug!("Next token refresh in {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped.changed() => break,
                }
                if *stopped.borrow() {
                    break;
                }
                manager.refresh_token().await;
            }
        });

        *slot = Some(AutoRefresh { stop, handle });
        true
    }

    /// Stop scheduled refreshes. Idempotent.
    pub async fn stop_auto_refresh(&self) {
        let running = self.auto_refresh.lock().await.take();
        if let Some(auto) = running {
            let _ = auto.stop.send(true);
            if let Err(e) = auto.handle.await {
                if !e.is_cancelled() {
                    warn!("Auto refresh task ended abnormally: {}", e);
                }
            }
            info!("Auto refresh stopped");
        }
    }

    /// Stop scheduled refreshes and release the capture session. Idempotent.
    pub async fn cleanup(&self) {
        self.stop_auto_refresh().await;
        self.capturer.close().await;
    }

    pub async fn stats(&self) -> CredentialStats {
        let state = self.state.read().await;
        let auto_refresh_running = self
            .auto_refresh
            .lock()
            .await
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished());

        CredentialStats {
            has_token: state.token.is_some(),
            token_preview: state.token.as_deref().map(mask_token),
            source: state.source,
            last_refresh: state.last_refresh,
            refresh_count: state.refresh_count,
            failure_count: state.failure_count,
            browser_refresh_enabled: state.browser_refresh_enabled,
            refreshing: self.refreshing.load(Ordering::Acquire),
            auto_refresh_running,
        }
    }

    pub async fn health(&self) -> CredentialHealth {
        let state = self.state.read().await;
        let now = Utc::now();
        health_of(&state, now, self.staleness)
    }
}

fn health_of(state: &Credential, now: DateTime<Utc>, staleness: Duration) -> CredentialHealth {
    let has_token = state.token.is_some();
    let token_age_secs = state.last_refresh.map(|t| (now - t).num_seconds());
    let stale = token_age_secs.is_some_and(|age| age > staleness.as_secs() as i64);
    let degraded = !state.browser_refresh_enabled;

    let fresh_enough = match state.last_refresh {
        Some(_) => !stale,
        None => state.seeded,
    };

    CredentialHealth {
        healthy: has_token && (fresh_enough || degraded),
        has_token,
        token_age_secs,
        stale,
        degraded,
        failure_rate: failure_rate(state.refresh_count, state.failure_count),
    }
}

fn failure_rate(refreshes: u64, failures: u64) -> String {
    if failures == 0 {
        return "0%".to_string();
    }
    let rate = failures as f64 / (refreshes + failures) as f64 * 100.0;
    format!("{:.2}%", rate)
}

/// Last eight characters behind a fixed mask.
fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let suffix: String = chars[chars.len() - 8..].iter().collect();
    format!("****{}", suffix)
}
