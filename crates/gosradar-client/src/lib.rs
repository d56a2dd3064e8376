//! Rate-limited, retrying HTTP client for the goszakup API with cursor
//! pagination and loop protection.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "gosradar-client";

pub const DEFAULT_BASE_URL: &str = "https://ows.goszakup.gov.kz";
pub const DEFAULT_PAGE_LIMIT: u32 = 200;

// ─── Retry policy ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// HTTP 429; backed off on the longer ladder.
    RateLimited,
    /// Timeouts, connection errors, 5xx.
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff with a separate base per error class: rate limiting
/// doubles from `rate_limit_base`, other transient failures from
/// `transient_base`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub rate_limit_base: Duration,
    pub transient_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            rate_limit_base: Duration::from_secs(5),
            transient_base: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, disposition: RetryDisposition, attempt_index: usize) -> Duration {
        let base = match disposition {
            RetryDisposition::RateLimited => self.rate_limit_base,
            _ => self.transient_base,
        };
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        base.saturating_mul(factor)
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("failed to fetch {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: usize },
}

// ─── Transport seam ──────────────────────────────────────────────────────────

/// One JSON GET against the upstream. The reqwest-backed implementation owns
/// the courtesy pause and the retry ladder; tests script this seam directly.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_json(&self, path: &str, params: &[(String, String)]) -> Result<Value, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    /// Flat pause before every request, a courtesy to the upstream's strict
    /// rate limit rather than a throttling algorithm.
    pub rate_limit_pause: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            timeout: Duration::from_secs(30),
            rate_limit_pause: Duration::from_millis(350),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    rate_limit_pause: Duration,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("building Authorization header")?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rate_limit_pause: config.rate_limit_pause,
            retry: config.retry,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(&self, path: &str, params: &[(String, String)]) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 0..self.retry.max_attempts {
            // Flat courtesy pause before every request, retries included.
            tokio::time::sleep(self.rate_limit_pause).await;
            let resp_result = self.client.get(&url).query(params).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json().await?);
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::NonRetryable {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url,
                        });
                    }

                    let delay = self.retry.delay_for_attempt(disposition, attempt);
                    warn!(%url, status = status.as_u16(), ?delay, "retryable status, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    let delay = self
                        .retry
                        .delay_for_attempt(RetryDisposition::Retryable, attempt);
                    warn!(%url, error = %err, ?delay, "request failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            url,
            attempts: self.retry.max_attempts,
        })
    }
}

// ─── Response shapes ─────────────────────────────────────────────────────────

/// The upstream answers list endpoints either as a bare JSON array or as an
/// object carrying an `items` array and a `next_page` cursor. Resolved once
/// here so downstream code always sees a uniform page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageBody {
    BareList(Vec<Value>),
    ItemsEnvelope {
        items: Vec<Value>,
        next_page: Option<String>,
    },
}

impl PageBody {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => PageBody::BareList(items),
            Value::Object(mut map) => {
                let items = match map.remove("items") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                let next_page = map.remove("next_page").and_then(cursor_token);
                PageBody::ItemsEnvelope { items, next_page }
            }
            _ => PageBody::BareList(Vec::new()),
        }
    }

    pub fn into_parts(self) -> (Vec<Value>, Option<String>) {
        match self {
            PageBody::BareList(items) => (items, None),
            PageBody::ItemsEnvelope { items, next_page } => (items, next_page),
        }
    }
}

fn cursor_token(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Single-item lookups may answer a bare object or a one-element list.
pub fn single_item(value: Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(value),
        Value::Array(mut items) => {
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        }
        _ => None,
    }
}

// ─── Client + paginator ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct GoszakupClient<T> {
    transport: T,
    page_limit: u32,
    max_pages: Option<usize>,
}

impl<T: Transport> GoszakupClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            page_limit: DEFAULT_PAGE_LIMIT,
            max_pages: None,
        }
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit;
        self
    }

    /// Hard page cap per pagination run, regardless of cursor state.
    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Value, FetchError> {
        self.transport.get_json(path, params).await
    }

    /// Single-item lookup tolerating both response shapes.
    pub async fn get_single(&self, path: &str) -> Result<Option<Value>, FetchError> {
        Ok(single_item(self.get(path, &[]).await?))
    }

    /// Start a fresh cursor walk from `params`. Not restartable mid-stream.
    pub fn paginate(&self, path: &str, params: &[(String, String)]) -> Paginator<'_, T> {
        Paginator {
            client: self,
            path: path.to_string(),
            params: params.to_vec(),
            cursor: None,
            seen_ids: HashSet::new(),
            pages_fetched: 0,
            done: false,
        }
    }
}

/// Page-at-a-time cursor walk. Terminates on an empty page, a missing or
/// stalled `next_page` token, a page of only already-seen ids (upstream
/// cursor looping protection), or the configured page cap.
pub struct Paginator<'a, T> {
    client: &'a GoszakupClient<T>,
    path: String,
    params: Vec<(String, String)>,
    cursor: Option<String>,
    seen_ids: HashSet<i64>,
    pages_fetched: usize,
    done: bool,
}

impl<T: Transport> Paginator<'_, T> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, FetchError> {
        if self.done {
            return Ok(None);
        }
        if let Some(cap) = self.client.max_pages {
            if self.pages_fetched >= cap {
                debug!(path = %self.path, cap, "page cap reached");
                self.done = true;
                return Ok(None);
            }
        }

        let mut params = self.params.clone();
        params.push(("limit".to_string(), self.client.page_limit.to_string()));
        if let Some(cursor) = &self.cursor {
            params.push(("next_page".to_string(), cursor.clone()));
        }

        debug!(path = %self.path, page = self.pages_fetched, "fetching page");
        let body = self.client.transport.get_json(&self.path, &params).await?;
        let (items, next_page) = PageBody::from_value(body).into_parts();
        self.pages_fetched += 1;

        if items.is_empty() {
            self.done = true;
            return Ok(None);
        }

        let mut any_id = false;
        let mut any_fresh = false;
        for id in items.iter().filter_map(|item| item.get("id").and_then(Value::as_i64)) {
            any_id = true;
            if self.seen_ids.insert(id) {
                any_fresh = true;
            }
        }
        if any_id && !any_fresh {
            warn!(path = %self.path, "page repeated already-seen ids, stopping pagination");
            self.done = true;
            return Ok(None);
        }

        match next_page {
            Some(token) if self.cursor.as_deref() != Some(token.as_str()) => {
                self.cursor = Some(token);
            }
            // Absent or stalled cursor: yield this page, then stop.
            _ => self.done = true,
        }

        Ok(Some(items))
    }

    /// Drain the remaining pages into one vector.
    pub async fn collect_items(&mut self) -> Result<Vec<Value>, FetchError> {
        let mut all = Vec::new();
        while let Some(items) = self.next_page().await? {
            all.extend(items);
        }
        Ok(all)
    }
}
