//! JSON-RPC 2.0 over HTTP, with rate limiting, a circuit breaker and retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use chainsync_core::{Backoff, RpcConfig, SyncError};

use crate::policy::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter};

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The result value; a missing result is `null`.
    pub fn into_result(self) -> Result<Value, TransportError> {
        match self.error {
            Some(err) => Err(TransportError::Rpc(err)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failure or non-2xx status.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Error object returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("circuit breaker open for {url}")]
    CircuitOpen { url: String },

    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Connection-level failures worth retrying inside the transport.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout { .. })
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::TransientSource(e.to_string())
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Something that can execute a JSON-RPC method and return its result.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError>;

    fn url(&self) -> &str;
}

/// Settings for [`HttpRpcClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    /// Retries after the first attempt, for retryable errors only.
    pub max_retries: u32,
    pub retry_backoff: Backoff,
    pub rate_limit_per_sec: f64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self::from(&RpcConfig::default())
    }
}

impl From<&RpcConfig> for HttpClientConfig {
    fn from(c: &RpcConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(c.timeout_ms),
            max_retries: c.max_retries,
            retry_backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0),
            rate_limit_per_sec: c.rate_limit_per_sec,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// HTTP JSON-RPC client shared by every source handle.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    config: HttpClientConfig,
    circuit: CircuitBreaker,
    limiter: RateLimiter,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, SyncError> {
        let url = url.into();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client for {url}: {e}")))?;
        Ok(Self {
            circuit: CircuitBreaker::new(config.circuit_breaker.clone()),
            limiter: RateLimiter::per_second(config.rate_limit_per_sec),
            url,
            http,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<Value, TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        let body = resp.bytes().await.map_err(|e| self.map_reqwest(e))?;
        let parsed: JsonRpcResponse = serde_json::from_slice(&body)?;
        parsed.into_result()
    }

    fn map_reqwest(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.config.request_timeout.as_millis() as u64,
            }
        } else {
            TransportError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let mut attempt = 0u32;
        loop {
            // Every attempt, retries included, rechecks the breaker and pays a token.
            if !self.circuit.is_allowed() {
                return Err(TransportError::CircuitOpen {
                    url: self.url.clone(),
                });
            }
            self.limiter.acquire().await;

            match self.send_once(&req).await {
                Ok(value) => {
                    self.circuit.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    self.circuit.record_failure();
                    attempt += 1;
                    match self.config.retry_backoff.delay_within(attempt, self.config.max_retries) {
                        Some(delay) => {
                            tracing::debug!(
                                method,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "retrying rpc call"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::warn!(method, attempt, error = %e, url = %self.url, "rpc call failed");
                            return Err(e);
                        }
                    }
                }
                // The node answered; it is reachable even if the call failed.
                Err(e) => {
                    self.circuit.record_success();
                    return Err(e);
                }
            }
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}
