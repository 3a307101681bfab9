//! Shared types for the sync pipeline.

use serde::{Deserialize, Serialize};

// ─── Persisted entities ──────────────────────────────────────────────────────

/// A confirmed block as written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block height.
    pub height: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: u64,
    /// Hashes of the contained transactions, in block order.
    pub tx_hashes: Vec<String>,
}

impl Block {
    /// The block without its transaction list.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            height: self.height,
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Block row without the transaction list, used by list queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
}

/// A transaction with its decoded sender and receipt logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash (`0x…`).
    pub hash: String,
    /// Recovered signer address.
    pub sender: String,
    /// Recipient address; `None` for contract creation.
    pub recipient: Option<String>,
    pub nonce: u64,
    /// Call data (`0x…`).
    pub input: String,
    /// Transferred value in wei, as a decimal string.
    pub value: String,
    pub block_height: u64,
    pub block_hash: String,
    /// Receipt logs ordered by index.
    pub logs: Vec<Log>,
}

/// A receipt log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Index of the log as reported by the receipt.
    pub index: u64,
    /// Log data (`0x…`).
    pub data: String,
}

// ─── Source-side shapes ──────────────────────────────────────────────────────

/// A block as reported by a [`ChainSource`](crate::source::ChainSource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBlock {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub tx_hashes: Vec<String>,
}

impl From<SourceBlock> for Block {
    fn from(b: SourceBlock) -> Self {
        Self {
            height: b.height,
            hash: b.hash,
            parent_hash: b.parent_hash,
            timestamp: b.timestamp,
            tx_hashes: b.tx_hashes,
        }
    }
}

/// The parts of a transaction receipt the engine keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReceipt {
    pub logs: Vec<Log>,
}

/// Fields recovered from a signed transaction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    pub sender: String,
    pub recipient: Option<String>,
    pub nonce: u64,
    /// Wei, decimal string.
    pub value: String,
    /// Call data (`0x…`).
    pub input: String,
}

// ─── Fetch output ────────────────────────────────────────────────────────────

/// A transaction left out of a height because it could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeFailure {
    pub tx_hash: String,
    pub reason: String,
}

/// Everything fetched for one height, ready to hand to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBlock {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    pub skipped: Vec<DecodeFailure>,
}

/// Result of writing one height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    /// The same `(height, hash)` was already stored; nothing changed.
    AlreadyPresent,
}
