//! Durable persistence contract, read-side queries, and an in-memory store.
//!
//! Writes go through [`Store::upsert`], which must be idempotent and atomic
//! per height. Reads go through [`BlockReader`] and may run concurrently with
//! writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::{Block, BlockHeader, Transaction, UpsertOutcome};

/// Write side of the persistence boundary.
#[async_trait]
pub trait Store: Send + Sync {
    /// Highest persisted height, or `None` if nothing has been written yet.
    async fn last_persisted_height(&self) -> Result<Option<u64>, SyncError>;

    /// Write a block and its transactions as one unit.
    ///
    /// Re-submitting a stored `(height, hash)` is a no-op that returns
    /// [`UpsertOutcome::AlreadyPresent`]. Submitting a stored height with a
    /// different hash returns [`SyncError::Integrity`] and changes nothing.
    async fn upsert(
        &self,
        block: &Block,
        transactions: &[Transaction],
    ) -> Result<UpsertOutcome, SyncError>;
}

/// Read side of the persistence boundary.
#[async_trait]
pub trait BlockReader: Send + Sync {
    /// Most recent blocks, newest first.
    async fn recent_blocks(&self, limit: u32) -> Result<Vec<BlockHeader>, SyncError>;

    async fn block(&self, height: u64) -> Result<Option<Block>, SyncError>;

    async fn transaction(&self, hash: &str) -> Result<Option<Transaction>, SyncError>;

    async fn block_count(&self) -> Result<u64, SyncError>;
}

/// Shared comparison used by every backend before writing.
///
/// Returns `Ok(true)` when the stored hash matches, `Ok(false)` when the
/// height is free, and an integrity error otherwise.
pub fn check_existing(
    height: u64,
    stored: Option<&str>,
    incoming: &str,
) -> Result<bool, SyncError> {
    match stored {
        None => Ok(false),
        Some(s) if s.eq_ignore_ascii_case(incoming) => Ok(true),
        Some(s) => Err(SyncError::Integrity {
            height,
            stored: s.to_string(),
            incoming: incoming.to_string(),
        }),
    }
}

// ─── In-memory store ─────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    blocks: BTreeMap<u64, Block>,
    transactions: HashMap<String, Transaction>,
}

/// In-memory store for tests and ephemeral runs. All data is lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, SyncError> {
        self.inner
            .lock()
            .map_err(|_| SyncError::Storage("memory store lock poisoned".into()))
    }

    /// Number of stored transactions.
    pub fn transaction_count(&self) -> usize {
        self.lock().map(|i| i.transactions.len()).unwrap_or(0)
    }

    /// All stored heights in ascending order.
    pub fn heights(&self) -> Vec<u64> {
        self.lock()
            .map(|i| i.blocks.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn last_persisted_height(&self) -> Result<Option<u64>, SyncError> {
        Ok(self.lock()?.blocks.keys().next_back().copied())
    }

    async fn upsert(
        &self,
        block: &Block,
        transactions: &[Transaction],
    ) -> Result<UpsertOutcome, SyncError> {
        let mut inner = self.lock()?;
        let stored = inner.blocks.get(&block.height).map(|b| b.hash.as_str());
        if check_existing(block.height, stored, &block.hash)? {
            return Ok(UpsertOutcome::AlreadyPresent);
        }
        inner.blocks.insert(block.height, block.clone());
        for tx in transactions {
            inner
                .transactions
                .entry(tx.hash.clone())
                .or_insert_with(|| tx.clone());
        }
        Ok(UpsertOutcome::Inserted)
    }
}

#[async_trait]
impl BlockReader for MemoryStore {
    async fn recent_blocks(&self, limit: u32) -> Result<Vec<BlockHeader>, SyncError> {
        Ok(self
            .lock()?
            .blocks
            .values()
            .rev()
            .take(limit as usize)
            .map(Block::header)
            .collect())
    }

    async fn block(&self, height: u64) -> Result<Option<Block>, SyncError> {
        Ok(self.lock()?.blocks.get(&height).cloned())
    }

    async fn transaction(&self, hash: &str) -> Result<Option<Transaction>, SyncError> {
        let inner = self.lock()?;
        Ok(inner
            .transactions
            .get(hash)
            .or_else(|| {
                inner
                    .transactions
                    .values()
                    .find(|t| t.hash.eq_ignore_ascii_case(hash))
            })
            .cloned())
    }

    async fn block_count(&self) -> Result<u64, SyncError> {
        Ok(self.lock()?.blocks.len() as u64)
    }
}
