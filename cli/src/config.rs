//! Config file loading and command-line overrides.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, then flags
//! and `CHAINSYNC_*` environment variables.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

use chainsync_core::{DecodePolicy, SyncConfig};

use crate::telemetry::LogConfig;

/// Contents of `chainsync.toml`.
///
/// ```toml
/// rpc_url = "http://localhost:8545"
/// database_url = "sqlite:./chainsync.db"
/// confirmation_depth = 12
///
/// [backoff]
/// max_ms = 30000
///
/// [log]
/// level = "info"
/// components = { chainsync_evm = "debug" }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(flatten)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl FileConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid config file")
    }

    /// Read `path`, or fall back to defaults when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("parsing {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// JSON-RPC endpoint of the chain node
    #[arg(long, global = true, env = "CHAINSYNC_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Store URL: memory:, sqlite:<path>, postgres://…
    #[arg(long, global = true, env = "CHAINSYNC_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Blocks behind head considered not yet final
    #[arg(long, global = true, env = "CHAINSYNC_CONFIRMATION_DEPTH")]
    pub confirmation_depth: Option<u64>,

    /// Heights fetched concurrently per cycle
    #[arg(long, global = true, env = "CHAINSYNC_MAX_WINDOW")]
    pub max_window: Option<u64>,

    /// Cursor position when the store is empty
    #[arg(long, global = true, env = "CHAINSYNC_START_HEIGHT")]
    pub start_height: Option<u64>,

    /// Abort the whole height when a transaction cannot be decoded
    #[arg(long, global = true, env = "CHAINSYNC_ABORT_ON_DECODE_ERROR")]
    pub abort_on_decode_error: bool,

    /// Log level (trace | debug | info | warn | error)
    #[arg(long, global = true, env = "CHAINSYNC_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true, env = "CHAINSYNC_LOG_JSON")]
    pub log_json: bool,
}

impl Overrides {
    pub fn apply(&self, file: &mut FileConfig) {
        let sync = &mut file.sync;
        if let Some(url) = &self.rpc_url {
            sync.rpc_url = url.clone();
        }
        if let Some(url) = &self.database_url {
            sync.database_url = url.clone();
        }
        if let Some(depth) = self.confirmation_depth {
            sync.confirmation_depth = depth;
        }
        if let Some(window) = self.max_window {
            sync.max_window = window;
        }
        if let Some(height) = self.start_height {
            sync.start_height = height;
        }
        if self.abort_on_decode_error {
            sync.decode_policy = DecodePolicy::AbortHeight;
        }
        if let Some(level) = &self.log_level {
            file.log.level = level.clone();
        }
        if self.log_json {
            file.log.json = true;
        }
    }
}
