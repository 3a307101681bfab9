//! Block fetcher: turns one height into persistable entities.
//!
//! A fetch never writes. It either returns a complete [`FetchedBlock`] or an
//! error, so a failed height cannot leave partial data behind.
//!
//! Transaction policy:
//! - I/O failures (raw transaction, missing or failed receipt) abort the
//!   height with a transient error; the coordinator retries it later.
//! - Deterministic decode failures follow [`DecodePolicy`]: either the
//!   transaction is skipped and reported in [`FetchedBlock::skipped`], or the
//!   height is aborted with [`SyncError::Decode`].

use futures::stream::{self, StreamExt};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::DecodePolicy;
use crate::error::SyncError;
use crate::source::ChainSource;
use crate::types::{Block, DecodeFailure, FetchedBlock, SourceBlock, Transaction};

/// Fetches and transforms single heights.
pub struct BlockFetcher {
    policy: DecodePolicy,
    receipt_concurrency: usize,
    chain_id: OnceCell<u64>,
}

impl BlockFetcher {
    pub fn new(policy: DecodePolicy, receipt_concurrency: usize) -> Self {
        Self {
            policy,
            receipt_concurrency: receipt_concurrency.max(1),
            chain_id: OnceCell::new(),
        }
    }

    pub fn policy(&self) -> DecodePolicy {
        self.policy
    }

    /// Chain id, fetched once and cached for the lifetime of the fetcher.
    pub async fn chain_id(&self, source: &dyn ChainSource) -> Result<u64, SyncError> {
        self.chain_id
            .get_or_try_init(|| source.chain_id())
            .await
            .copied()
    }

    /// Fetch `height`, stopping early if `cancel` fires.
    pub async fn fetch(
        &self,
        source: &dyn ChainSource,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<FetchedBlock, SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            res = self.fetch_inner(source, height) => res,
        }
    }

    async fn fetch_inner(
        &self,
        source: &dyn ChainSource,
        height: u64,
    ) -> Result<FetchedBlock, SyncError> {
        let block = source
            .block_at(height)
            .await?
            .ok_or_else(|| SyncError::TransientSource(format!("block {height} not available")))?;
        if block.height != height {
            return Err(SyncError::TransientSource(format!(
                "asked for block {height}, source returned {}",
                block.height
            )));
        }

        let chain_id = self.chain_id(source).await?;

        let results: Vec<Result<Result<Transaction, DecodeFailure>, SyncError>> =
            stream::iter(block.tx_hashes.clone())
                .map(|tx_hash| {
                    let block = &block;
                    async move {
                        self.fetch_transaction(source, block, &tx_hash, chain_id)
                            .await
                    }
                })
                .buffered(self.receipt_concurrency)
                .collect()
                .await;

        let mut transactions = Vec::with_capacity(results.len());
        let mut skipped = Vec::new();
        for result in results {
            match result? {
                Ok(tx) => transactions.push(tx),
                Err(failure) => skipped.push(failure),
            }
        }

        tracing::debug!(
            height,
            hash = %block.hash,
            txs = transactions.len(),
            skipped = skipped.len(),
            "fetched block"
        );

        Ok(FetchedBlock {
            block: Block::from(block),
            transactions,
            skipped,
        })
    }

    /// Outer error aborts the height; inner error is a skipped transaction.
    async fn fetch_transaction(
        &self,
        source: &dyn ChainSource,
        block: &SourceBlock,
        tx_hash: &str,
        chain_id: u64,
    ) -> Result<Result<Transaction, DecodeFailure>, SyncError> {
        let raw = source.raw_transaction(tx_hash).await?;

        let decoded = match source.decode_sender(&raw, chain_id) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(
                    tx_hash,
                    height = block.height,
                    error = %e,
                    policy = ?self.policy,
                    "failed to decode transaction"
                );
                return match self.policy {
                    DecodePolicy::SkipTransaction => Ok(Err(DecodeFailure {
                        tx_hash: tx_hash.to_string(),
                        reason: e.to_string(),
                    })),
                    DecodePolicy::AbortHeight => Err(SyncError::Decode {
                        tx_hash: tx_hash.to_string(),
                        source: e,
                    }),
                };
            }
        };

        let receipt = source.receipt_for(tx_hash).await?.ok_or_else(|| {
            SyncError::TransientSource(format!("receipt for {tx_hash} not available"))
        })?;
        let mut logs = receipt.logs;
        logs.sort_by_key(|l| l.index);

        Ok(Ok(Transaction {
            hash: tx_hash.to_string(),
            sender: decoded.sender,
            recipient: decoded.recipient,
            nonce: decoded.nonce,
            input: decoded.input,
            value: decoded.value,
            block_height: block.height,
            block_hash: block.hash.clone(),
            logs,
        }))
    }
}
