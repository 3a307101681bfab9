//! PostgreSQL store.
//!
//! Requires the `postgres` feature:
//! ```toml
//! chainsync-storage = { version = "0.1", features = ["postgres"] }
//! ```
//!
//! Tables are created on first connect:
//! - `blocks`: one row per persisted height
//! - `transactions`: decoded transactions with their receipt logs as JSON

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use chainsync_core::store::check_existing;
use chainsync_core::{
    Block, BlockHeader, BlockReader, Log, Store, SyncError, Transaction, UpsertOutcome,
};

use crate::rows::{db_err, from_json, now_unix, to_i64, to_json, to_u64};

/// Pool settings for [`PostgresStore`].
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// PostgreSQL-backed store. Cloning shares the pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with default pool options and create the schema.
    pub async fn connect(database_url: &str) -> Result<Self, SyncError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(opts.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| SyncError::Storage(format!("postgres connect: {e}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("postgres store ready");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                height      BIGINT PRIMARY KEY,
                hash        TEXT   NOT NULL,
                parent_hash TEXT   NOT NULL,
                timestamp   BIGINT NOT NULL,
                tx_hashes   TEXT   NOT NULL,
                indexed_at  BIGINT NOT NULL,
                UNIQUE (height, hash)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                hash         TEXT   PRIMARY KEY,
                sender       TEXT   NOT NULL,
                recipient    TEXT,
                nonce        BIGINT NOT NULL,
                input        TEXT   NOT NULL,
                value        TEXT   NOT NULL,
                block_height BIGINT NOT NULL,
                block_hash   TEXT   NOT NULL,
                logs         TEXT   NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions (block_height)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

fn header_from_row(row: &PgRow) -> Result<BlockHeader, SyncError> {
    Ok(BlockHeader {
        height: to_u64(row.get("height"), "height")?,
        hash: row.get("hash"),
        parent_hash: row.get("parent_hash"),
        timestamp: to_u64(row.get("timestamp"), "timestamp")?,
    })
}

fn block_from_row(row: &PgRow) -> Result<Block, SyncError> {
    let header = header_from_row(row)?;
    Ok(Block {
        height: header.height,
        hash: header.hash,
        parent_hash: header.parent_hash,
        timestamp: header.timestamp,
        tx_hashes: from_json(row.get::<&str, _>("tx_hashes"), "tx_hashes")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, SyncError> {
    Ok(Transaction {
        hash: row.get("hash"),
        sender: row.get("sender"),
        recipient: row.get("recipient"),
        nonce: to_u64(row.get("nonce"), "nonce")?,
        input: row.get("input"),
        value: row.get("value"),
        block_height: to_u64(row.get("block_height"), "block_height")?,
        block_hash: row.get("block_hash"),
        logs: from_json::<Vec<Log>>(row.get::<&str, _>("logs"), "logs")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn last_persisted_height(&self) -> Result<Option<u64>, SyncError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(height) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        max.map(|h| to_u64(h, "height")).transpose()
    }

    async fn upsert(
        &self,
        block: &Block,
        transactions: &[Transaction],
    ) -> Result<UpsertOutcome, SyncError> {
        let height = to_i64(block.height, "height")?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // A concurrent writer on the same height blocks here until it
        // commits, then the conflict is resolved against its hash.
        let inserted = sqlx::query(
            "INSERT INTO blocks (height, hash, parent_hash, timestamp, tx_hashes, indexed_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (height) DO NOTHING",
        )
        .bind(height)
        .bind(&block.hash)
        .bind(&block.parent_hash)
        .bind(to_i64(block.timestamp, "timestamp")?)
        .bind(to_json(&block.tx_hashes)?)
        .bind(now_unix())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if inserted == 0 {
            let stored: Option<String> =
                sqlx::query_scalar("SELECT hash FROM blocks WHERE height = $1")
                    .bind(height)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
            if check_existing(block.height, stored.as_deref(), &block.hash)? {
                debug!(height = block.height, "block already stored");
                return Ok(UpsertOutcome::AlreadyPresent);
            }
            return Err(SyncError::Storage(format!(
                "height {} conflicted but no row is stored",
                block.height
            )));
        }

        for t in transactions {
            sqlx::query(
                "INSERT INTO transactions
                 (hash, sender, recipient, nonce, input, value, block_height, block_hash, logs)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (hash) DO NOTHING",
            )
            .bind(t.hash.to_lowercase())
            .bind(&t.sender)
            .bind(&t.recipient)
            .bind(to_i64(t.nonce, "nonce")?)
            .bind(&t.input)
            .bind(&t.value)
            .bind(to_i64(t.block_height, "block_height")?)
            .bind(&t.block_hash)
            .bind(to_json(&t.logs)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(height = block.height, txs = transactions.len(), "block stored");
        Ok(UpsertOutcome::Inserted)
    }
}

#[async_trait]
impl BlockReader for PostgresStore {
    async fn recent_blocks(&self, limit: u32) -> Result<Vec<BlockHeader>, SyncError> {
        let rows = sqlx::query(
            "SELECT height, hash, parent_hash, timestamp
             FROM blocks ORDER BY height DESC LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(header_from_row).collect()
    }

    async fn block(&self, height: u64) -> Result<Option<Block>, SyncError> {
        let row = sqlx::query(
            "SELECT height, hash, parent_hash, timestamp, tx_hashes FROM blocks WHERE height = $1",
        )
        .bind(to_i64(height, "height")?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn transaction(&self, hash: &str) -> Result<Option<Transaction>, SyncError> {
        let row = sqlx::query(
            "SELECT hash, sender, recipient, nonce, input, value, block_height, block_hash, logs
             FROM transactions WHERE hash = $1",
        )
        .bind(hash.to_lowercase())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn block_count(&self) -> Result<u64, SyncError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        to_u64(n, "count")
    }
}
