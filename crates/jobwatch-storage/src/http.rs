use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, Instrument};

/// Structured reason a fetch failed. Only `Transient` failures are worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, connection resets, 5xx, 429.
    Transient,
    /// 404/410: the board or posting is gone.
    NotFound,
    /// 401/403/451: the site is actively refusing us.
    Blocked,
    /// The host name does not resolve.
    Unresolvable,
    /// Bad URL, redirect loop, or any other 4xx.
    InvalidEndpoint,
    /// The body could not be decoded into the expected shape.
    Malformed,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::Transient)
    }
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FailureClass::NotFound,
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => FailureClass::Blocked,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => FailureClass::Transient,
        s if s.is_server_error() => FailureClass::Transient,
        _ => FailureClass::InvalidEndpoint,
    }
}

/// Classifies a transport error. Connect failures are refined by
/// [`HttpFetcher`] with a DNS lookup, since reqwest does not expose that kind.
pub fn classify_reqwest_error(err: &reqwest::Error) -> FailureClass {
    if let Some(status) = err.status() {
        classify_status(status)
    } else if err.is_builder() || err.is_redirect() {
        FailureClass::InvalidEndpoint
    } else if err.is_decode() {
        FailureClass::Malformed
    } else {
        FailureClass::Transient
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
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket that sustains `max_rps` requests per second with a burst of the same size.
    pub fn per_second(max_rps: f64) -> Option<Self> {
        if !max_rps.is_finite() || max_rps <= 0.0 {
            return None;
        }
        Some(Self {
            capacity: max_rps.ceil().max(1.0) as u32,
            refill_every: Duration::from_secs_f64(1.0 / max_rps),
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}")]
    InvalidUrl { url: String },
    #[error("request to {url} failed ({class:?}): {source}")]
    Request {
        url: String,
        class: FailureClass,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        class: FailureClass,
    },
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::InvalidUrl { .. } => FailureClass::InvalidEndpoint,
            FetchError::Request { class, .. } | FetchError::HttpStatus { class, .. } => *class,
            FetchError::Decode { .. } => FailureClass::Malformed,
        }
    }
}

/// Shared HTTP client. Performs single attempts; retry policy belongs to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url` and return the body as text; non-2xx statuses become classified errors.
    pub async fn get_text(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;

        // Semaphores are never closed, so acquire only fails if that invariant breaks.
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::InvalidUrl { url: url.to_string() })?;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::InvalidUrl { url: url.to_string() })?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = tracing::info_span!("http_fetch", source, url);
        async move {
            let resp = match self.client.get(parsed.clone()).send().await {
                Ok(resp) => resp,
                Err(err) => return Err(self.request_error(&parsed, err).await),
            };

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                debug!(status = status.as_u16(), "non-success status");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    class: classify_status(status),
                });
            }

            match resp.text().await {
                Ok(body) => Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                }),
                Err(err) => Err(self.request_error(&parsed, err).await),
            }
        }
        .instrument(span)
        .await
    }

    /// GET `url` and decode the body as JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, source: &str, url: &str) -> Result<T, FetchError> {
        let resp = self.get_text(source, url).await?;
        serde_json::from_str(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }

    async fn request_error(&self, url: &Url, err: reqwest::Error) -> FetchError {
        let mut class = classify_reqwest_error(&err);
        if err.is_connect() && !host_resolves(url).await {
            class = FailureClass::Unresolvable;
        }
        FetchError::Request {
            url: url.to_string(),
            class,
            source: err,
        }
    }
}

async fn host_resolves(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let port = url.port_or_known_default().unwrap_or(443);
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next().is_some(),
        Err(_) => false,
    }
}
