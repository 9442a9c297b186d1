//! Search execution against the upstream source.
//!
//! [`SearchExecutor`] is the seam workers call; [`HttpSearchExecutor`] is the
//! reqwest implementation that walks result pages with a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::SourceConfig;
use crate::humanize;

/// One search term's harvested results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub records: Vec<Value>,
    /// Upstream total when reported, otherwise the number of records fetched.
    pub result_count: u64,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The token was rejected; the caller should refresh it.
    #[error("Unauthorized (HTTP {0})")]
    Unauthorized(u16),
    #[error("Rate limited (HTTP {0})")]
    RateLimited(u16),
    #[error("HTTP {0}")]
    Http(u16),
    #[error("Request timed out")]
    Timeout,
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl ExecutorError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Performs the paginated search for one term.
#[async_trait]
pub trait SearchExecutor: Send + Sync {
    async fn search(&self, term: &str, token: &str) -> Result<SearchPage, ExecutorError>;
}

/// reqwest-backed executor.
pub struct HttpSearchExecutor {
    client: Client,
    config: SourceConfig,
}

impl HttpSearchExecutor {
    pub fn new(config: SourceConfig) -> Result<Self, ExecutorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .build()
            .map_err(|e| ExecutorError::Request(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn fetch_page(&self, term: &str, token: &str, page: u32) -> Result<Value, ExecutorError> {
        let user_agent = self
            .config
            .user_agent
            .clone()
            .unwrap_or_else(|| humanize::random_user_agent().to_string());

        let mut query: Vec<(String, String)> = vec![
            (self.config.term_param.clone(), term.to_string()),
            (self.config.page_param.clone(), page.to_string()),
        ];
        if let Some(ref size_param) = self.config.page_size_param {
            query.push((size_param.clone(), self.config.page_size.to_string()));
        }

        let response = self
            .client
            .get(&self.config.search_url)
            .query(&query)
            .bearer_auth(token)
            .header("User-Agent", user_agent)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl SearchExecutor for HttpSearchExecutor {
    async fn search(&self, term: &str, token: &str) -> Result<SearchPage, ExecutorError> {
        let mut result = SearchPage::default();
        let mut reported_total = None;
        let first = self.config.first_page;

        for page in first..first.saturating_add(self.config.max_pages.max(1)) {
            let body = self.fetch_page(term, token, page).await?;
            let records = extract_records(&body, &self.config.records_field)?;
            let fetched = records.len();

            if reported_total.is_none() {
                reported_total = self
                    .config
                    .total_field
                    .as_deref()
                    .and_then(|field| lookup(&body, field))
                    .and_then(Value::as_u64);
            }
            result.records.extend(records);

            if !has_more(fetched, self.config.page_size) {
                break;
            }
            debug!("{:?}: page {} returned {} records, continuing", term, page, fetched);
        }

        result.result_count = reported_total.unwrap_or(result.records.len() as u64);
        Ok(result)
    }
}

fn classify_status(status: StatusCode) -> ExecutorError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ExecutorError::Unauthorized(status.as_u16())
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            ExecutorError::RateLimited(status.as_u16())
        }
        _ => ExecutorError::Http(status.as_u16()),
    }
}

/// A full page means there may be another one.
fn has_more(fetched: usize, page_size: u32) -> bool {
    fetched > 0 && fetched >= page_size as usize
}

/// Resolve a dotted path (`data.results`); empty means the root.
fn lookup<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(body);
    }
    let pointer = format!("/{}", path.replace('.', "/"));
    body.pointer(&pointer)
}

fn extract_records(body: &Value, field: &str) -> Result<Vec<Value>, ExecutorError> {
    match lookup(body, field) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(ExecutorError::Decode(format!(
            "expected an array at '{}', found {}",
            field,
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_nested_records() {
        let body = json!({"data": {"results": [{"id": 1}, {"id": 2}]}, "total": 40});
        let records = extract_records(&body, "data.results").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(lookup(&body, "total").and_then(Value::as_u64), Some(40));
    }

    #[test]
    fn test_extract_root_array_and_missing_field() {
        let body = json!([{"id": 1}]);
        assert_eq!(extract_records(&body, "").unwrap().len(), 1);

        let body = json!({"other": []});
        assert!(extract_records(&body, "results").unwrap().is_empty());
    }

    #[test]
    fn test_extract_rejects_non_array() {
        let body = json!({"results": "nope"});
        assert!(matches!(
            extract_records(&body, "results"),
            Err(ExecutorError::Decode(_))
        ));
    }

    #[test]
    fn test_auth_statuses_are_unauthorized() {
        assert!(classify_status(StatusCode::UNAUTHORIZED).is_unauthorized());
        assert!(classify_status(StatusCode::FORBIDDEN).is_unauthorized());
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ExecutorError::RateLimited(429)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            ExecutorError::Http(502)
        ));
    }

    #[test]
    fn test_pagination_stops_on_short_page() {
        assert!(has_more(100, 100));
        assert!(!has_more(99, 100));
        assert!(!has_more(0, 100));
    }
}
