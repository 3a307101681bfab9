//! Engine configuration and coordinator state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// What the fetcher does with a transaction whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Record the failure, persist the block and its other transactions.
    #[default]
    SkipTransaction,
    /// Fail the whole height; the coordinator backs off and retries it.
    AbortHeight,
}

/// Exponential backoff parameters for failed cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_backoff_initial_ms() -> u64 { 1_000 }
fn default_backoff_max_ms() -> u64 { 60_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

/// RPC transport parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Per-request timeout.
    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,
    /// In-transport retries for connection-level failures.
    #[serde(default = "default_rpc_max_retries")]
    pub max_retries: u32,
    /// Requests per second allowed by the token bucket.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: f64,
}

fn default_rpc_timeout_ms() -> u64 { 30_000 }
fn default_rpc_max_retries() -> u32 { 3 }
fn default_rate_limit_per_sec() -> f64 { 50.0 }

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_rpc_timeout_ms(),
            max_retries: default_rpc_max_retries(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
        }
    }
}

/// Configuration for a sync engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// JSON-RPC endpoint of the chain node.
    #[serde(default)]
    pub rpc_url: String,
    /// Store URL (`memory:`, `sqlite:…`, `postgres://…`).
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Number of blocks behind head considered not yet final.
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    /// Maximum number of heights fetched concurrently in one cycle.
    #[serde(default = "default_max_window")]
    pub max_window: u64,
    /// Sleep between polls when caught up.
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
    /// Cursor position used when the store is empty. The first fetched
    /// height is `start_height + 1`.
    #[serde(default)]
    pub start_height: u64,
    /// Receipts fetched concurrently within one height.
    #[serde(default = "default_receipt_concurrency")]
    pub receipt_concurrency: usize,
    /// Number of chain source handles shared by fetch tasks.
    #[serde(default = "default_source_pool_size")]
    pub source_pool_size: usize,
    #[serde(default)]
    pub decode_policy: DecodePolicy,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
}

fn default_database_url() -> String { "memory:".into() }
fn default_confirmation_depth() -> u64 { 12 }
fn default_max_window() -> u64 { 20 }
fn default_idle_poll_interval_ms() -> u64 { 5_000 }
fn default_receipt_concurrency() -> usize { 8 }
fn default_source_pool_size() -> usize { 4 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            database_url: default_database_url(),
            confirmation_depth: default_confirmation_depth(),
            max_window: default_max_window(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
            start_height: 0,
            receipt_concurrency: default_receipt_concurrency(),
            source_pool_size: default_source_pool_size(),
            decode_policy: DecodePolicy::default(),
            backoff: BackoffConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.rpc_url.trim().is_empty() {
            return Err(SyncError::Config("rpc_url is required".into()));
        }
        if self.database_url.trim().is_empty() {
            return Err(SyncError::Config("database_url is required".into()));
        }
        if self.max_window == 0 {
            return Err(SyncError::Config("max_window must be at least 1".into()));
        }
        if self.receipt_concurrency == 0 {
            return Err(SyncError::Config("receipt_concurrency must be at least 1".into()));
        }
        if self.source_pool_size == 0 {
            return Err(SyncError::Config("source_pool_size must be at least 1".into()));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(SyncError::Config("backoff.multiplier must be >= 1.0".into()));
        }
        if self.rpc.rate_limit_per_sec <= 0.0 {
            return Err(SyncError::Config("rpc.rate_limit_per_sec must be positive".into()));
        }
        Ok(())
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }
}

/// Fluent builder for [`SyncConfig`].
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.config.rpc_url = url.into();
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    pub fn max_window(mut self, window: u64) -> Self {
        self.config.max_window = window;
        self
    }

    pub fn idle_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.idle_poll_interval_ms = ms;
        self
    }

    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = height;
        self
    }

    pub fn receipt_concurrency(mut self, n: usize) -> Self {
        self.config.receipt_concurrency = n;
        self
    }

    pub fn source_pool_size(mut self, n: usize) -> Self {
        self.config.source_pool_size = n;
        self
    }

    pub fn decode_policy(mut self, policy: DecodePolicy) -> Self {
        self.config.decode_policy = policy;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> Result<SyncConfig, SyncError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Runtime state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorState {
    /// No window in flight.
    Idle,
    /// Window dispatched, fetch tasks running.
    Fetching,
    /// Writing fetched heights to the store.
    Persisting,
    /// Waiting before retrying a failed cycle.
    Backoff,
    /// Stopped cycling after an integrity error.
    Halted,
    /// Shut down by cancellation.
    Stopped,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Persisting => write!(f, "persisting"),
            Self::Backoff => write!(f, "backoff"),
            Self::Halted => write!(f, "halted"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
