//! chainsync CLI: follow a chain into a database and inspect the result.
//!
//! # Commands
//! ```text
//! chainsync run                 follow the chain until Ctrl-C
//! chainsync status              cursor position (head, safe, persisted, lag)
//! chainsync blocks --limit <N>  most recent stored blocks
//! chainsync block <height>      one stored block
//! chainsync tx <hash>           one stored transaction
//! chainsync info                effective config and chain id
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chainsync_core::{ChainSource, Coordinator, SyncConfig, SyncCursor};
use chainsync_evm::EvmChainSource;
use chainsync_storage::open_store;

mod config;
mod telemetry;

use config::{FileConfig, Overrides};

#[derive(Parser)]
#[command(
    name = "chainsync",
    about = "Follow a chain's confirmed blocks into a database",
    long_about = "
chainsync: fetch confirmed blocks and their transactions from an Ethereum
JSON-RPC node and persist them to SQLite or PostgreSQL.

ENVIRONMENT VARIABLES:
  CHAINSYNC_RPC_URL           JSON-RPC endpoint
  CHAINSYNC_DATABASE_URL      memory:, sqlite:<path>, postgres://…
  CHAINSYNC_LOG_LEVEL         default log level
  RUST_LOG                    full filter, overrides the log settings
",
    version
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true, env = "CHAINSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the chain until interrupted
    Run,

    /// Show the cursor position without writing anything
    Status,

    /// List the most recently stored blocks, newest first
    Blocks {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Show a stored block
    Block {
        height: u64,
    },

    /// Show a stored transaction
    Tx {
        /// Transaction hash (0x-prefixed, any case)
        hash: String,
    },

    /// Show the effective configuration and the node's chain id
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut file = FileConfig::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut file);
    telemetry::init_tracing(&file.log);

    let config = file.sync;
    match cli.command {
        Commands::Run => cmd_run(validated(config)?).await,
        Commands::Status => cmd_status(validated(config)?).await,
        Commands::Blocks { limit } => cmd_blocks(&config, limit).await,
        Commands::Block { height } => cmd_block(&config, height).await,
        Commands::Tx { hash } => cmd_tx(&config, &hash).await,
        Commands::Info => cmd_info(validated(config)?).await,
    }
}

fn validated(config: SyncConfig) -> Result<SyncConfig> {
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run(config: SyncConfig) -> Result<()> {
    let pool = EvmChainSource::pool(&config).context("building chain source")?;
    let store = open_store(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;

    let mut coordinator = Coordinator::new(&config, Arc::new(pool), store.writer());

    // Both sides must answer once before the loop starts.
    let position = coordinator
        .position()
        .await
        .context("initial connection to node and store")?;
    info!(
        rpc = %config.rpc_url,
        store = store.name(),
        head = position.head_height,
        safe = position.safe_height,
        last_persisted = position.last_persisted,
        resumed = position.resumed,
        "chainsync starting"
    );

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C; shutting down"),
        }
        signal.cancel();
    });

    coordinator.run(&cancel).await.context("sync stopped")?;
    info!(state = %coordinator.state(), "chainsync stopped");
    Ok(())
}

async fn cmd_status(config: SyncConfig) -> Result<()> {
    let source = EvmChainSource::connect(&config).context("building chain source")?;
    let store = open_store(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;

    let cursor = SyncCursor::new(config.confirmation_depth, config.start_height);
    let position = cursor
        .position(&source, &*store.writer())
        .await
        .context("reading position")?;

    print_json(&json!({
        "store": store.name(),
        "head_height": position.head_height,
        "safe_height": position.safe_height,
        "last_persisted": position.last_persisted,
        "resumed": position.resumed,
        "lag": position.lag(),
    }))
}

async fn cmd_blocks(config: &SyncConfig, limit: u32) -> Result<()> {
    let store = open_store(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;
    let blocks = store
        .reader()
        .recent_blocks(limit)
        .await
        .context("listing blocks")?;
    print_json(&blocks)
}

async fn cmd_block(config: &SyncConfig, height: u64) -> Result<()> {
    let store = open_store(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;
    match store.reader().block(height).await.context("reading block")? {
        Some(block) => print_json(&block),
        None => bail!("block {height} is not stored"),
    }
}

async fn cmd_tx(config: &SyncConfig, hash: &str) -> Result<()> {
    let store = open_store(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;
    match store
        .reader()
        .transaction(hash)
        .await
        .context("reading transaction")?
    {
        Some(tx) => print_json(&tx),
        None => bail!("transaction {hash} is not stored"),
    }
}

async fn cmd_info(config: SyncConfig) -> Result<()> {
    let source = EvmChainSource::connect(&config).context("building chain source")?;
    let chain_id = source.chain_id().await.context("querying chain id")?;
    let head = source.head_height().await.context("querying head height")?;

    print_json(&json!({
        "version": env!("CARGO_PKG_VERSION"),
        "chain_id": chain_id,
        "head_height": head,
        "config": config,
    }))
}
