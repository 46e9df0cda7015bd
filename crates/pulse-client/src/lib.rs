//! Consumed remote capabilities: paginated search + batch sentiment classifiers.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::SentimentLabel;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "pulse-client";

/// One post as returned by the remote search API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchItem {
    pub id: String,
    pub text: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// One page of search results plus the cursor for the next page, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub items: Vec<SearchItem>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("remote search rate limited")]
    RateLimited,
    #[error("transient remote search failure: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("fatal remote search failure: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl SearchError {
    /// Rate-limit and transient failures are worth another attempt;
    /// fatal ones abort pagination.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SearchError::RateLimited | SearchError::Transient(_))
    }
}

/// Remote search capability: given a query and an optional page token,
/// return up to `page_size` items and the next token.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(
        &self,
        query: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<SearchPage, SearchError>;
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("classifier returned {got} results for {expected} inputs")]
    Misaligned { expected: usize, got: usize },
}

/// Batch sentiment capability. Output aligns 1:1 with the input order;
/// implementations must verify that alignment, not assume it.
#[async_trait]
pub trait SentimentClassifier: Send + Sync {
    async fn classify(&self, texts: &[String]) -> Result<Vec<SentimentLabel>, ClassifierError>;
}

/// Exponential backoff with a hard cap, shared by callers that retry
/// transient remote failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Connection settings shared by the HTTP client implementations.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

fn search_error_for_status(status: StatusCode, url: &str) -> SearchError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        SearchError::RateLimited
    } else if status.is_server_error() {
        SearchError::Transient(anyhow::anyhow!("http status {status} for {url}"))
    } else {
        SearchError::Fatal(anyhow::anyhow!("http status {status} for {url}"))
    }
}

fn search_error_for_request(err: reqwest::Error) -> SearchError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SearchError::Transient(err.into())
    } else {
        SearchError::Fatal(err.into())
    }
}

/// Remote search over HTTP: `GET {base_url}?query=..&page_size=..[&page_token=..]`.
#[derive(Debug)]
pub struct HttpSearchClient {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpSearchClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            config,
        })
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(
        &self,
        query: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<SearchPage, SearchError> {
        let span = info_span!("remote_search", query, page_size);
        let _guard = span.enter();

        let page_size = page_size.to_string();
        let mut request = self
            .client
            .get(&self.config.base_url)
            .query(&[("query", query), ("page_size", page_size.as_str())]);
        if let Some(token) = page_token {
            request = request.query(&[("page_token", token)]);
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(search_error_for_request)?;
        let status = response.status();
        if !status.is_success() {
            let url = response.url().to_string();
            return Err(search_error_for_status(status, &url));
        }

        response
            .json::<SearchPage>()
            .await
            .map_err(|err| SearchError::Fatal(anyhow::Error::from(err).context("decoding search page")))
    }
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    results: Vec<SentimentLabel>,
}

/// Batch classifier over HTTP: `POST {base_url}` with `{"texts": [..]}`.
#[derive(Debug)]
pub struct HttpClassifier {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpClassifier {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            config,
        })
    }
}

#[async_trait]
impl SentimentClassifier for HttpClassifier {
    async fn classify(&self, texts: &[String]) -> Result<Vec<SentimentLabel>, ClassifierError> {
        let span = info_span!("classify_batch", batch = texts.len());
        let _guard = span.enter();

        let mut request = self
            .client
            .post(&self.config.base_url)
            .json(&ClassifyRequest { texts });
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ClassifierError::Unavailable(err.into()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Unavailable(anyhow::anyhow!(
                "http status {status} from classifier"
            )));
        }

        let decoded: ClassifyResponse = response
            .json()
            .await
            .map_err(|err| ClassifierError::Unavailable(err.into()))?;

        // Alignment with the input order is load-bearing downstream.
        if decoded.results.len() != texts.len() {
            return Err(ClassifierError::Misaligned {
                expected: texts.len(),
                got: decoded.results.len(),
            });
        }
        Ok(decoded.results)
    }
}
