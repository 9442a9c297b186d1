//! Token capture seam and token-shape validation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a token was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    RequestHeader,
    ResponseHeader,
    LocalStorage,
    SessionStorage,
    Cookie,
    /// Seeded from config or the environment.
    Env,
}

impl TokenSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestHeader => "request_header",
            Self::ResponseHeader => "response_header",
            Self::LocalStorage => "local_storage",
            Self::SessionStorage => "session_storage",
            Self::Cookie => "cookie",
            Self::Env => "env",
        }
    }
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated token and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedToken {
    pub token: String,
    pub source: TokenSource,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The automation session could not be started. Permanent.
    #[error("Capture unavailable: {0}")]
    Unavailable(String),
    #[error("Capture timed out after {0:?}")]
    Timeout(Duration),
    /// Candidates were found but none looked like a bearer token.
    #[error("Token shape invalid: {0}")]
    TokenShapeInvalid(String),
    #[error("No token found: {0}")]
    NotFound(String),
    #[error("Capture failed: {0}")]
    Failed(String),
}

impl CaptureError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Obtains a fresh bearer token.
///
/// A call may be cancelled at any await point when the manager's timeout
/// fires; implementations must leave themselves usable for the next call.
#[async_trait]
pub trait CredentialCapturer: Send + Sync {
    async fn capture(&self) -> Result<CapturedToken, CaptureError>;

    /// Release long-lived resources. Safe to call more than once.
    async fn close(&self) {}
}

/// Capturer used when browser refresh is not configured or not compiled in.
pub struct DisabledCapturer {
    reason: String,
}

impl DisabledCapturer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CredentialCapturer for DisabledCapturer {
    async fn capture(&self) -> Result<CapturedToken, CaptureError> {
        Err(CaptureError::Unavailable(self.reason.clone()))
    }
}

/// Accepts values that look like a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValidator {
    pub min_length: usize,
    /// Required prefix; empty accepts any.
    pub prefix: String,
}

impl Default for TokenValidator {
    fn default() -> Self {
        Self {
            min_length: 20,
            prefix: "eyJ".to_string(),
        }
    }
}

impl TokenValidator {
    pub fn new(min_length: usize, prefix: impl Into<String>) -> Self {
        Self {
            min_length,
            prefix: prefix.into(),
        }
    }

    /// Normalize `raw` and return it if it passes. Strips `Bearer ` and
    /// surrounding quotes.
    pub fn validate(&self, raw: &str) -> Option<String> {
        let mut value = raw.trim();
        if value
            .get(..7)
            .is_some_and(|p| p.eq_ignore_ascii_case("bearer "))
        {
            value = value[7..].trim();
        }
        let value = value.trim_matches('"');

        if value.is_empty() || value.chars().count() < self.min_length {
            return None;
        }
        if !value.starts_with(&self.prefix) {
            return None;
        }
        if value.chars().any(char::is_whitespace) {
            return None;
        }
        Some(value.to_string())
    }

    /// Validate a storage value, which may be a raw token or a JSON object
    /// holding one.
    pub fn validate_stored(&self, raw: &str) -> Option<String> {
        if let Some(token) = self.validate(raw) {
            return Some(token);
        }
        let parsed: serde_json::Value = serde_json::from_str(raw).ok()?;
        ["access_token", "accessToken", "token", "id_token", "idToken"]
            .iter()
            .filter_map(|key| parsed.get(*key).and_then(|v| v.as_str()))
            .find_map(|candidate| self.validate(candidate))
    }
}
