//! Rate-limited HTTP client with retry/backoff shared by the provider clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(concat!("folio/", env!("CARGO_PKG_VERSION")).to_string()),
            global_concurrency: 8,
            per_provider_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug)]
struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl SimpleTokenBucket {
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new((config.capacity, Instant::now())),
        }
    }

    async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let (tokens, last_refill) = &mut *state;
            let elapsed = last_refill.elapsed();
            if self.refill_every.as_millis() > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                *tokens = tokens.saturating_add(refills).min(self.capacity);
                *last_refill = Instant::now();
            }
            if *tokens > 0 {
                *tokens -= 1;
                return;
            }
            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

/// One outbound provider call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub json: Option<serde_json::Value>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            json: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, url).json(body)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("could not reach {url}: {message}")]
    Connect { url: String, message: String },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: Vec<u8> },
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            FetchError::Timeout { url }
        } else if err.is_connect() {
            FetchError::Connect {
                url,
                message: err.to_string(),
            }
        } else {
            FetchError::Transport {
                url,
                message: err.to_string(),
            }
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<SimpleTokenBucket>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket.map(SimpleTokenBucket::new),
            backoff: config.backoff,
        })
    }

    async fn per_provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    /// Sends `spec`, retrying timeouts, connect failures, 429 and 5xx with
    /// exponential backoff. Non-success responses keep their body so callers
    /// can decode provider error payloads.
    pub async fn send(&self, provider: &str, spec: &RequestSpec) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("provider_request", provider, method = %spec.method, url = %spec.url);
        self.send_inner(provider, spec).instrument(span).await
    }

    async fn send_inner(&self, provider: &str, spec: &RequestSpec) -> Result<FetchedResponse, FetchError> {
        let per_provider = self.per_provider_semaphore(provider).await;
        // Permits are only unavailable once the semaphore is closed, which never happens here.
        let _global = self.global_limit.acquire().await.ok();
        let _provider = per_provider.acquire().await.ok();

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let mut attempt = 0;
        loop {
            let mut request = self.client.request(spec.method.clone(), &spec.url);
            if !spec.query.is_empty() {
                request = request.query(&spec.query);
            }
            for (key, value) in &spec.headers {
                request = request.header(key.as_str(), value.as_str());
            }
            if let Some(body) = &spec.json {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|err| FetchError::from_reqwest(&final_url, err))?
                        .to_vec();

                    if status.is_success() {
                        debug!(status = status.as_u16(), bytes = body.len(), "provider response");
                        return Ok(FetchedResponse { status, final_url, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        warn!(status = status.as_u16(), attempt, "retrying provider request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        warn!(error = %err, attempt, "retrying provider request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::from_reqwest(&spec.url, err));
                }
            }
        }
    }
}
