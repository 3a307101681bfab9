//! The remote ledger abstraction.

use async_trait::async_trait;

use crate::error::{DecodeError, SyncError};
use crate::types::{DecodedTransaction, SourceBlock, SourceReceipt};

/// Read-only access to the chain being followed.
///
/// Every I/O method may fail with [`SyncError::TransientSource`] and must
/// return within a bounded time. Implementations are shared across fetch
/// tasks, so they must be `Send + Sync`.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Highest block height the node currently reports.
    async fn head_height(&self) -> Result<u64, SyncError>;

    /// Block at `height`, or `None` if the node does not know it.
    async fn block_at(&self, height: u64) -> Result<Option<SourceBlock>, SyncError>;

    /// Signed transaction envelope bytes for `tx_hash`.
    async fn raw_transaction(&self, tx_hash: &str) -> Result<Vec<u8>, SyncError>;

    /// Receipt for `tx_hash`, or `None` if not yet available.
    async fn receipt_for(&self, tx_hash: &str) -> Result<Option<SourceReceipt>, SyncError>;

    /// Chain identifier used for signature recovery.
    async fn chain_id(&self) -> Result<u64, SyncError>;

    /// Recover sender, recipient and value from a signed payload. Pure.
    fn decode_sender(&self, raw_tx: &[u8], chain_id: u64)
        -> Result<DecodedTransaction, DecodeError>;
}
