//! Resilient HTTP client for the upstream property-management API
//!
//! Every call goes through the same pipeline: circuit breaker pre-check,
//! bearer auth, a hard per-request timeout, status classification, and
//! retry with exponential backoff for transient failures. Rate-limit
//! headers are parsed into a snapshot returned with the body.

use reqwest::{Client, Method, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::breaker::CircuitBreaker;
use super::rate_limit::{retry_after_secs, RateLimitSnapshot};
use super::retry::RetryManager;
use crate::config::{RetryConfig, UpstreamConfig};
use crate::error::SyncError;
use crate::otel::SyncMetrics;

/// Longest error body excerpt carried in a `ClientError`
const ERROR_BODY_LIMIT: usize = 512;

/// Per-call options
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Overrides the client's default timeout
    pub timeout_ms: Option<u64>,
    /// Bypass the breaker pre-check (health probes)
    pub skip_breaker: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            query: Vec::new(),
            body: None,
            timeout_ms: None,
            skip_breaker: false,
        }
    }
}

impl CallOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn skip_breaker(mut self) -> Self {
        self.skip_breaker = true;
        self
    }
}

/// Successful upstream response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub rate_limit: RateLimitSnapshot,
    pub elapsed: Duration,
    /// Retries spent before this response arrived
    pub retries: u32,
}

/// HTTP client with timeout, retry, circuit breaking and rate-limit parsing
pub struct ResilientClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
    retry: RetryManager,
    metrics: Option<Arc<SyncMetrics>>,
}

impl ResilientClient {
    /// Create a client for the configured upstream
    pub fn new(
        upstream: &UpstreamConfig,
        retry: RetryConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, SyncError> {
        let base_url = upstream
            .base_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SyncError::InvalidData("upstream.base_url is not set".to_string()))?;

        let client = Client::builder()
            .user_agent(concat!("property-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: upstream.api_token.clone(),
            timeout: Duration::from_millis(upstream.timeout_ms),
            breaker,
            retry: RetryManager::new(retry),
            metrics: None,
        })
    }

    /// Attach metrics instruments
    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Perform a call with retry
    pub async fn call(&self, path: &str, options: &CallOptions) -> Result<ApiResponse, SyncError> {
        let result = self
            .retry
            .execute(|attempt| self.call_once(path, options, attempt))
            .await;

        match result {
            Ok((mut response, retries)) => {
                response.retries = retries;
                if let Some(metrics) = &self.metrics {
                    metrics.record_retries(retries as u64);
                }
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    /// Health probe that ignores an open breaker
    pub async fn probe(&self, path: &str) -> Result<ApiResponse, SyncError> {
        self.call(path, &CallOptions::get().skip_breaker()).await
    }

    async fn call_once(
        &self,
        path: &str,
        options: &CallOptions,
        attempt: u32,
    ) -> Result<ApiResponse, SyncError> {
        if !options.skip_breaker {
            if let Err(e) = self.breaker.check() {
                if let Some(metrics) = &self.metrics {
                    metrics.record_breaker_rejection();
                }
                debug!(path = path, error = %e, "Call refused by circuit breaker");
                return Err(e);
            }
        }

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(options.method.clone(), &url)
            .query(&options.query);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);

        debug!(method = %options.method, url = %url, attempt = attempt, "Sending upstream request");
        let started = Instant::now();

        let response = match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => {
                warn!(url = %url, timeout_ms = timeout.as_millis() as u64, "Upstream request timed out");
                self.record_status("timeout");
                return Err(SyncError::Timeout);
            }
            Ok(Err(e)) => {
                self.record_status("network");
                return Err(if e.is_timeout() {
                    SyncError::Timeout
                } else {
                    SyncError::Network(e.to_string())
                });
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let rate_limit = RateLimitSnapshot::from_headers(&headers);

        match status {
            s if s.is_success() => {
                self.breaker.record_success();
                self.record_status("2xx");

                let bytes = match tokio::time::timeout(timeout, response.bytes()).await {
                    Err(_) => return Err(SyncError::Timeout),
                    Ok(Err(e)) => return Err(SyncError::Network(e.to_string())),
                    Ok(Ok(bytes)) => bytes,
                };
                let body = if bytes.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::from_slice(&bytes)
                        .map_err(|e| SyncError::InvalidData(format!("Invalid JSON body: {}", e)))?
                };

                let elapsed = started.elapsed();
                debug!(
                    url = %url,
                    status = s.as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    remaining = ?rate_limit.remaining,
                    "Received upstream response"
                );

                Ok(ApiResponse {
                    status: s.as_u16(),
                    body,
                    rate_limit,
                    elapsed,
                    retries: 0,
                })
            }
            StatusCode::TOO_MANY_REQUESTS => {
                self.record_status("429");
                let retry_after = retry_after_secs(&headers);
                warn!(url = %url, retry_after = ?retry_after, "Rate limited by upstream");
                Err(SyncError::RateLimited {
                    retry_after_secs: retry_after,
                })
            }
            s if s.is_server_error() => {
                self.record_status("5xx");
                self.breaker.record_server_error();
                warn!(url = %url, status = s.as_u16(), "Upstream server error");
                Err(SyncError::ServerError(s.as_u16()))
            }
            s => {
                self.record_status("4xx");
                // Bounded like the headers; a stalled body leaves the message empty
                let message: String = match tokio::time::timeout(timeout, response.text()).await {
                    Ok(Ok(text)) => text.chars().take(ERROR_BODY_LIMIT).collect(),
                    Ok(Err(e)) => {
                        debug!(url = %url, error = %e, "Failed to read upstream error body");
                        String::new()
                    }
                    Err(_) => {
                        warn!(
                            url = %url,
                            timeout_ms = timeout.as_millis() as u64,
                            "Timed out reading upstream error body"
                        );
                        String::new()
                    }
                };
                warn!(url = %url, status = s.as_u16(), "Upstream rejected request");
                Err(SyncError::ClientError {
                    status: s.as_u16(),
                    message,
                })
            }
        }
    }

    fn record_status(&self, class: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_upstream_request(class);
        }
    }
}
