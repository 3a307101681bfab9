//! SQLite store.
//!
//! Single-file persistence through `sqlx` with WAL mode, so readers
//! (`chainsync blocks`, `chainsync tx`) can query while the engine writes.
//!
//! # Usage
//! ```rust,no_run
//! use chainsync_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::open("./chainsync.db").await?;
//! let ephemeral = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use chainsync_core::store::check_existing;
use chainsync_core::{
    Block, BlockHeader, BlockReader, Log, Store, SyncError, Transaction, UpsertOutcome,
};

use crate::rows::{db_err, from_json, now_unix, to_i64, to_json, to_u64};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Accepts a plain path (`"./chainsync.db"`) or a SQLite URL
    /// (`"sqlite:./chainsync.db"`). A missing file is created either way.
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let options = if path.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(path).map_err(db_err)?
        } else {
            SqliteConnectOptions::new().filename(path)
        };
        let options = options.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database; gone when the store is dropped.
    pub async fn in_memory() -> Result<Self, SyncError> {
        // Every connection to `:memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                height      INTEGER PRIMARY KEY,
                hash        TEXT    NOT NULL,
                parent_hash TEXT    NOT NULL,
                timestamp   INTEGER NOT NULL,
                tx_hashes   TEXT    NOT NULL,
                indexed_at  INTEGER NOT NULL,
                UNIQUE (height, hash)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                hash         TEXT    PRIMARY KEY,
                sender       TEXT    NOT NULL,
                recipient    TEXT,
                nonce        INTEGER NOT NULL,
                input        TEXT    NOT NULL,
                value        TEXT    NOT NULL,
                block_height INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                logs         TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions (block_height);",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn transaction_count(&self) -> Result<u64, SyncError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        to_u64(n, "count")
    }
}

fn block_from_row(row: &SqliteRow) -> Result<Block, SyncError> {
    Ok(Block {
        height: to_u64(row.get("height"), "height")?,
        hash: row.get("hash"),
        parent_hash: row.get("parent_hash"),
        timestamp: to_u64(row.get("timestamp"), "timestamp")?,
        tx_hashes: from_json(row.get::<&str, _>("tx_hashes"), "tx_hashes")?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<Transaction, SyncError> {
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
impl Store for SqliteStore {
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

        // Insert first: a concurrent writer on the same height turns into a
        // conflict here, which is then resolved against the stored hash.
        let inserted = sqlx::query(
            "INSERT INTO blocks (height, hash, parent_hash, timestamp, tx_hashes, indexed_at)
             VALUES (?, ?, ?, ?, ?, ?)
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
                sqlx::query_scalar("SELECT hash FROM blocks WHERE height = ?")
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
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
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
impl BlockReader for SqliteStore {
    async fn recent_blocks(&self, limit: u32) -> Result<Vec<BlockHeader>, SyncError> {
        let rows = sqlx::query(
            "SELECT height, hash, parent_hash, timestamp
             FROM blocks ORDER BY height DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| -> Result<BlockHeader, SyncError> {
                Ok(BlockHeader {
                    height: to_u64(r.get("height"), "height")?,
                    hash: r.get("hash"),
                    parent_hash: r.get("parent_hash"),
                    timestamp: to_u64(r.get("timestamp"), "timestamp")?,
                })
            })
            .collect()
    }

    async fn block(&self, height: u64) -> Result<Option<Block>, SyncError> {
        let row = sqlx::query(
            "SELECT height, hash, parent_hash, timestamp, tx_hashes FROM blocks WHERE height = ?",
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
             FROM transactions WHERE hash = ?",
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
