//! Browser-driven token capture over CDP.
//!
//! One browser is launched (or connected to) lazily and reused. Every capture
//! attempt runs in its own browser context, performs a search on the target
//! page, and looks for the bearer token in this order: request headers,
//! response headers, a bounded wait for a qualifying API request, then
//! storage and cookies.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::{BrowserContextId, CloseParams};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventRequestWillBeSent, EventResponseReceived, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::capture::{CaptureError, CapturedToken, CredentialCapturer, TokenSource, TokenValidator};
use super::cleanup::CleanupGuard;
use crate::config::BrowserCaptureConfig;
use crate::humanize;

/// Response headers that sometimes carry a refreshed token.
const RESPONSE_TOKEN_HEADERS: &[&str] = &[
    "authorization",
    "x-auth-token",
    "x-access-token",
    "access-token",
];

/// Common Chrome executable locations.
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

/// Traffic observed during one capture attempt.
#[derive(Debug, Clone)]
struct ObservedHeaders {
    url: String,
    headers: Value,
}

#[derive(Default)]
struct Traffic {
    requests: Vec<ObservedHeaders>,
    responses: Vec<ObservedHeaders>,
}

struct Session {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
}

impl Session {
    /// The CDP handler loop ends when the browser dies or the socket drops.
    fn is_alive(&self) -> bool {
        handler_alive(&self.handler)
    }

    async fn shutdown(self) {
        match Arc::try_unwrap(self.browser) {
            Ok(mut browser) => {
                if let Err(e) = browser.close().await {
                    debug!("Browser close failed: {}", e);
                }
                let _ = browser.wait().await;
            }
            // A deferred context cleanup still holds a handle.
            Err(shared) => {
                if let Err(e) = shared.execute(CloseParams::default()).await {
                    debug!("Browser close failed: {}", e);
                }
            }
        }
        self.handler.abort();
    }
}

fn handler_alive(handler: &JoinHandle<()>) -> bool {
    !handler.is_finished()
}

/// Everything one capture attempt opens in the browser.
#[derive(Default)]
struct CaptureResources {
    browser: Option<Arc<Browser>>,
    context_id: Option<BrowserContextId>,
    page: Option<Page>,
    listeners: Vec<JoinHandle<()>>,
}

fn dispose_capture(resources: CaptureResources) -> BoxFuture<'static, ()> {
    async move {
        for listener in resources.listeners {
            listener.abort();
        }
        if let Some(page) = resources.page {
            let _ = page.close().await;
        }
        if let (Some(browser), Some(context_id)) = (resources.browser, resources.context_id) {
            if let Err(e) = browser
                .execute(DisposeBrowserContextParams::new(context_id))
                .await
            {
                debug!("Failed to dispose browser context: {}", e);
            }
        }
    }
    .boxed()
}

pub struct BrowserCapturer {
    config: BrowserCaptureConfig,
    validator: TokenValidator,
    request_pattern: Regex,
    session: Mutex<Option<Session>>,
}

impl BrowserCapturer {
    pub fn new(config: BrowserCaptureConfig, validator: TokenValidator) -> Result<Self, CaptureError> {
        let request_pattern = Regex::new(&config.request_url_pattern)
            .map_err(|e| CaptureError::Failed(format!("invalid request pattern: {}", e)))?;
        Ok(Self {
            config,
            validator,
            request_pattern,
            session: Mutex::new(None),
        })
    }

    fn find_chrome(&self) -> Result<PathBuf, CaptureError> {
        if let Some(ref path) = self.config.chrome_path {
            let expanded = shellexpand::tilde(path);
            return Ok(PathBuf::from(expanded.as_ref()));
        }
        for path in CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                info!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }
        for cmd in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
            if let Ok(path) = which::which(cmd) {
                info!("Found Chrome in PATH: {}", path.display());
                return Ok(path);
            }
        }
        Err(CaptureError::Unavailable(
            "Chrome/Chromium not found; install it or set browser.chrome_path".to_string(),
        ))
    }

    async fn launch(&self) -> Result<Session, CaptureError> {
        if let Some(ref remote_url) = self.config.remote_url {
            return self.connect_remote(remote_url).await;
        }

        info!("Launching browser (headless={})", self.config.headless);
        let chrome_path = self.find_chrome()?;
        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);
        if !self.config.headless {
            builder = builder.with_head();
        }
        builder = builder
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-gpu");

        let browser_config = builder
            .build()
            .map_err(|e| CaptureError::Unavailable(format!("browser config: {}", e)))?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::Unavailable(format!("failed to launch browser: {}", e)))?;

        let handler = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });
        Ok(Session {
            browser: Arc::new(browser),
            handler,
        })
    }

    async fn connect_remote(&self, url: &str) -> Result<Session, CaptureError> {
        info!("Connecting to remote browser at {}", url);
        let ws_url = if url.starts_with("ws://") || url.starts_with("wss://") {
            url.to_string()
        } else {
            let version_url = format!("{}/json/version", url.trim_end_matches('/'));
            let unavailable = |e: reqwest::Error| {
                CaptureError::Unavailable(format!("remote browser at {}: {}", url, e))
            };
            let resp: Value = reqwest::Client::new()
                .get(&version_url)
                .send()
                .await
                .map_err(unavailable)?
                .json()
                .await
                .map_err(unavailable)?;
            resp.get("webSocketDebuggerUrl")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    CaptureError::Unavailable("no webSocketDebuggerUrl in response".to_string())
                })?
        };

        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .map_err(|e| CaptureError::Unavailable(format!("failed to connect: {}", e)))?;
        let handler = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });
        Ok(Session {
            browser: Arc::new(browser),
            handler,
        })
    }

    /// One capture attempt inside an isolated context.
    ///
    /// The context, page and listeners are released even if this future is
    /// dropped by the caller's timeout.
    async fn capture_in_context(&self, session: &Session) -> Result<CapturedToken, CaptureError> {
        let browser = Arc::clone(&session.browser);
        let created = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| CaptureError::Failed(format!("create context: {}", e)))?;
        let context_id = created.result.browser_context_id.clone();

        let mut guard = CleanupGuard::new(
            CaptureResources {
                browser: Some(Arc::clone(&browser)),
                context_id: Some(context_id.clone()),
                ..Default::default()
            },
            dispose_capture,
        );
        let result = self.open_and_search(&browser, context_id, &mut guard).await;
        guard.run().await;
        result
    }

    async fn open_and_search(
        &self,
        browser: &Browser,
        context_id: BrowserContextId,
        guard: &mut CleanupGuard<CaptureResources>,
    ) -> Result<CapturedToken, CaptureError> {
        let failed = |what: &str, e: &dyn std::fmt::Display| {
            CaptureError::Failed(format!("{}: {}", what, e))
        };

        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id)
            .build()
            .map_err(|e| failed("target params", &e))?;
        let page = browser
            .new_page(params)
            .await
            .map_err(|e| failed("new page", &e))?;
        guard.resources_mut().page = Some(page.clone());

        let traffic = Arc::new(Mutex::new(Traffic::default()));
        let listeners = self.listen(&page, &traffic).await?;
        guard.resources_mut().listeners.extend(listeners);

        self.search_for_token(&page, &traffic).await
    }

    async fn listen(
        &self,
        page: &Page,
        traffic: &Arc<Mutex<Traffic>>,
    ) -> Result<Vec<JoinHandle<()>>, CaptureError> {
        let failed = |e: chromiumoxide::error::CdpError| CaptureError::Failed(format!("listener: {}", e));

        page.execute(EnableParams::default()).await.map_err(failed)?;
        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(failed)?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(failed)?;

        let sink = Arc::clone(traffic);
        let request_task = tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                sink.lock().await.requests.push(ObservedHeaders {
                    url: event.request.url.clone(),
                    headers: event.request.headers.inner().clone(),
                });
            }
        });

        let sink = Arc::clone(traffic);
        let response_task = tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                sink.lock().await.responses.push(ObservedHeaders {
                    url: event.response.url.clone(),
                    headers: event.response.headers.inner().clone(),
                });
            }
        });

        Ok(vec![request_task, response_task])
    }

    async fn search_for_token(
        &self,
        page: &Page,
        traffic: &Arc<Mutex<Traffic>>,
    ) -> Result<CapturedToken, CaptureError> {
        let failed = |what: &str, e: chromiumoxide::error::CdpError| {
            CaptureError::Failed(format!("{}: {}", what, e))
        };

        page.execute(SetUserAgentOverrideParams::new(
            humanize::random_user_agent().to_string(),
        ))
        .await
        .map_err(|e| failed("user agent", e))?;

        debug!("Navigating to {}", self.config.target_url);
        page.goto(self.config.target_url.as_str())
            .await
            .map_err(|e| failed("navigate", e))?;

        let input = page
            .find_element(self.config.search_input_selector.as_str())
            .await
            .map_err(|e| failed("search input", e))?;
        input.click().await.map_err(|e| failed("focus input", e))?;
        tokio::time::sleep(humanize::random_delay(200, 600)).await;
        input
            .type_str(self.config.search_term.as_str())
            .await
            .map_err(|e| failed("type search term", e))?;
        input
            .press_key("Enter")
            .await
            .map_err(|e| failed("submit", e))?;

        tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;

        let mut saw_candidate = false;

        // Authorization sent by the page.
        {
            let observed = traffic.lock().await;
            saw_candidate |= observed.requests.iter().any(|r| has_authorization(&r.headers));
            if let Some(token) = first_request_token(&observed.requests, None, &self.validator) {
                return Ok(CapturedToken {
                    token,
                    source: TokenSource::RequestHeader,
                });
            }
            if let Some(token) = first_response_token(&observed.responses, &self.validator) {
                return Ok(CapturedToken {
                    token,
                    source: TokenSource::ResponseHeader,
                });
            }
        }

        // Bounded wait for the API request itself.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.request_wait_secs);
        while tokio::time::Instant::now() < deadline {
            {
                let observed = traffic.lock().await;
                if let Some(token) =
                    first_request_token(&observed.requests, Some(&self.request_pattern), &self.validator)
                {
                    return Ok(CapturedToken {
                        token,
                        source: TokenSource::RequestHeader,
                    });
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        if let Some(captured) = self.inspect_storage(page, &mut saw_candidate).await {
            return Ok(captured);
        }

        if saw_candidate {
            Err(CaptureError::TokenShapeInvalid(
                "authorization values found but none passed validation".to_string(),
            ))
        } else {
            Err(CaptureError::NotFound(format!(
                "no token after searching {:?} on {}",
                self.config.search_term, self.config.target_url
            )))
        }
    }

    async fn inspect_storage(&self, page: &Page, saw_candidate: &mut bool) -> Option<CapturedToken> {
        let keys = serde_json::to_string(&self.config.storage_keys).ok()?;
        let script = format!(
            r#"(() => {{
                const keys = {keys};
                const read = (store) => {{
                    const out = {{}};
                    try {{
                        for (const k of keys) {{
                            const v = store.getItem(k);
                            if (v !== null) out[k] = v;
                        }}
                    }} catch (e) {{}}
                    return out;
                }};
                return {{ local: read(window.localStorage), session: read(window.sessionStorage) }};
            }})()"#
        );

        match page.evaluate(script).await {
            Ok(result) => {
                let stored: Value = result.into_value().unwrap_or(Value::Null);
                for (field, source) in [
                    ("local", TokenSource::LocalStorage),
                    ("session", TokenSource::SessionStorage),
                ] {
                    let Some(entries) = stored.get(field).and_then(Value::as_object) else {
                        continue;
                    };
                    for key in &self.config.storage_keys {
                        if let Some(raw) = entries.get(key).and_then(Value::as_str) {
                            *saw_candidate = true;
                            if let Some(token) = self.validator.validate_stored(raw) {
                                return Some(CapturedToken { token, source });
                            }
                        }
                    }
                }
            }
            Err(e) => debug!("Storage inspection failed: {}", e),
        }

        match page.get_cookies().await {
            Ok(cookies) => {
                for name in &self.config.cookie_names {
                    if let Some(cookie) = cookies.iter().find(|c| &c.name == name) {
                        *saw_candidate = true;
                        if let Some(token) = self.validator.validate_stored(&cookie.value) {
                            return Some(CapturedToken {
                                token,
                                source: TokenSource::Cookie,
                            });
                        }
                    }
                }
            }
            Err(e) => debug!("Cookie inspection failed: {}", e),
        }
        None
    }
}

#[async_trait]
impl CredentialCapturer for BrowserCapturer {
    async fn capture(&self) -> Result<CapturedToken, CaptureError> {
        if self.config.target_url.is_empty() {
            return Err(CaptureError::Unavailable(
                "browser.target_url is not configured".to_string(),
            ));
        }

        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|s| !s.is_alive()) {
            warn!("Browser session ended, relaunching");
            if let Some(dead) = slot.take() {
                dead.shutdown().await;
            }
        }
        if slot.is_none() {
            *slot = Some(self.launch().await?);
        }
        let Some(session) = slot.as_ref() else {
            return Err(CaptureError::Unavailable("browser session missing".to_string()));
        };

        let result = self.capture_in_context(session).await;
        if let Err(ref e) = result {
            warn!("Browser capture attempt failed: {}", e);
        }
        result
    }

    async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown().await;
            info!("Browser session closed");
        }
    }
}

/// Look up a header case-insensitively.
fn header<'a>(headers: &'a Value, name: &str) -> Option<&'a str> {
    headers
        .as_object()?
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.as_str())
}

fn has_authorization(headers: &Value) -> bool {
    header(headers, "authorization").is_some()
}

/// First valid `Authorization` token, optionally restricted to matching URLs.
fn first_request_token(
    requests: &[ObservedHeaders],
    pattern: Option<&Regex>,
    validator: &TokenValidator,
) -> Option<String> {
    requests
        .iter()
        .filter(|r| pattern.map_or(true, |re| re.is_match(&r.url)))
        .filter_map(|r| header(&r.headers, "authorization"))
        .find_map(|value| validator.validate(value))
}

fn first_response_token(responses: &[ObservedHeaders], validator: &TokenValidator) -> Option<String> {
    responses.iter().find_map(|r| {
        RESPONSE_TOKEN_HEADERS
            .iter()
            .filter_map(|name| header(&r.headers, name))
            .find_map(|value| validator.validate(value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOKEN: &str = "eyJhbGciOiJIUzI1NiJ9.payload.signature";

    fn observed(url: &str, headers: Value) -> ObservedHeaders {
        ObservedHeaders {
            url: url.to_string(),
            headers,
        }
    }

    #[test]
    fn test_request_token_case_insensitive() {
        let requests = vec![
            observed("https://site.example/app.js", json!({"Accept": "*/*"})),
            observed(
                "https://site.example/api/search?q=Main",
                json!({"authorization": format!("Bearer {}", TOKEN)}),
            ),
        ];
        let validator = TokenValidator::default();
        assert_eq!(
            first_request_token(&requests, None, &validator).as_deref(),
            Some(TOKEN)
        );
    }

    #[test]
    fn test_request_token_respects_pattern() {
        let requests = vec![observed(
            "https://analytics.example/collect",
            json!({"Authorization": format!("Bearer {}", TOKEN)}),
        )];
        let validator = TokenValidator::default();
        let pattern = Regex::new("/api/search").unwrap();
        assert!(first_request_token(&requests, Some(&pattern), &validator).is_none());
        assert!(first_request_token(&requests, None, &validator).is_some());
    }

    #[test]
    fn test_response_token_headers() {
        let responses = vec![observed(
            "https://site.example/api/session",
            json!({"X-Access-Token": TOKEN}),
        )];
        let validator = TokenValidator::default();
        assert_eq!(
            first_response_token(&responses, &validator).as_deref(),
            Some(TOKEN)
        );
    }

    #[test]
    fn test_invalid_authorization_is_skipped() {
        let requests = vec![observed(
            "https://site.example/api/search",
            json!({"Authorization": "Basic dXNlcjpwYXNz"}),
        )];
        let validator = TokenValidator::default();
        assert!(has_authorization(&requests[0].headers));
        assert!(first_request_token(&requests, None, &validator).is_none());
    }

    #[tokio::test]
    async fn test_finished_handler_marks_session_dead() {
        let handler = tokio::spawn(async {});
        tokio::time::timeout(Duration::from_secs(1), async {
            while !handler.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!handler_alive(&handler));

        let running = tokio::spawn(std::future::pending::<()>());
        assert!(handler_alive(&running));
        running.abort();
    }

    #[tokio::test]
    async fn test_missing_target_url_is_unavailable() {
        let capturer =
            BrowserCapturer::new(BrowserCaptureConfig::default(), TokenValidator::default()).unwrap();
        assert!(capturer.capture().await.unwrap_err().is_unavailable());
        capturer.close().await;
    }
}
