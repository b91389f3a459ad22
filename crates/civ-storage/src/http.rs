use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

/// Server errors and throttling are worth another attempt; other statuses are not.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Retry schedule for transient upstream failures. Zero retries by default:
/// the next scheduled tick is a source's retry unless `CIV_HTTP_MAX_RETRIES`
/// says otherwise.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
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

    /// Calls `op` until it succeeds, fails permanently, or retries run out.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(error = %err, attempt, ?delay, "transient upstream failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// One outbound GET: URL, query pairs, and extra headers (e.g. an app token).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub source_id: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    /// Timeouts, refused connections, 5xx and 429 are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(is_transient_status)
                .unwrap_or(false),
            FetchError::Decode { .. } => false,
        }
    }
}

/// Upstream transport seam. Adapters only ever talk to upstreams through this.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_text(&self, request: &FetchRequest) -> Result<String, FetchError>;

    async fn get_json(&self, request: &FetchRequest) -> Result<serde_json::Value, FetchError> {
        let body = self.get_text(request).await?;
        serde_json::from_str(&body).map_err(|err| FetchError::Decode {
            url: request.url.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn send_once(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.text().await?;
        debug!(bytes = body.len(), status = status.as_u16(), "fetched");
        Ok(body)
    }

    async fn send_with_backoff(&self, request: &FetchRequest) -> Result<String, FetchError> {
        // Semaphores are never closed.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(&request.source_id).await;
        let _source = per_source.acquire().await.ok();

        self.backoff.retry(move || self.send_once(request)).await
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn get_text(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", source_id = %request.source_id, url = %request.url);
        self.send_with_backoff(request).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Canned(&'static str);

    #[async_trait]
    impl Transport for Canned {
        async fn get_text(&self, _request: &FetchRequest) -> Result<String, FetchError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::default().max_retries, 0);
    }

    fn status_error(status: u16) -> FetchError {
        FetchError::HttpStatus {
            status,
            url: "https://example.test".into(),
        }
    }

    fn quick(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_up_to_the_limit() {
        let calls = AtomicUsize::new(0);
        let flaky = || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(status_error(503))
                } else {
                    Ok(n)
                }
            }
        };

        assert_eq!(quick(2).retry(flaky).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        assert!(quick(1).retry(flaky).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        calls.store(0, Ordering::SeqCst);
        assert!(BackoffPolicy::default().retry(flaky).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), FetchError> = quick(3)
            .retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(status_error(404)) }
            })
            .await;
        assert!(matches!(result, Err(FetchError::HttpStatus { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn only_server_errors_and_throttling_are_transient() {
        let status = status_error;
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(400).is_transient());
        assert!(!FetchError::Decode {
            url: String::new(),
            message: "eof".into(),
        }
        .is_transient());
    }

    #[tokio::test]
    async fn json_decoding_failures_carry_the_url() {
        let request = FetchRequest::new("fdny", "https://example.test/data.json").query("$limit", "10");
        assert_eq!(request.query_value("$limit"), Some("10"));

        let ok = Canned(r#"[{"a":1}]"#).get_json(&request).await.expect("json");
        assert!(ok.is_array());

        let err = Canned("<html>maintenance</html>")
            .get_json(&request)
            .await
            .expect_err("not json");
        match err {
            FetchError::Decode { url, .. } => assert_eq!(url, "https://example.test/data.json"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
