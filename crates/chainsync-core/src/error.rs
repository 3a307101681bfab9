//! Error types for the sync pipeline.

use thiserror::Error;

/// Errors that can occur while following the chain.
#[derive(Debug, Error)]
pub enum SyncError {
    /// RPC timeout, connection failure, JSON-RPC error or data the node does
    /// not have yet. Always retried.
    #[error("transient source error: {0}")]
    TransientSource(String),

    /// A transaction could not be decoded.
    #[error("decode error in tx {tx_hash}: {source}")]
    Decode {
        tx_hash: String,
        #[source]
        source: DecodeError,
    },

    /// The store already holds `height` with a different hash.
    #[error("integrity error at height {height}: stored hash {stored}, incoming hash {incoming}")]
    Integrity {
        height: u64,
        stored: String,
        incoming: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration or unreachable dependency at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Returns `true` if the coordinator should back off and retry the cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientSource(_) | Self::Storage(_) | Self::Decode { .. }
        )
    }

    /// Returns `true` if the error signals an unhandled reorg.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Reasons a signed transaction payload could not be turned into
/// sender / recipient / value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed transaction envelope: {0}")]
    Malformed(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("chain id mismatch: transaction signed for {found}, source is {expected}")]
    ChainIdMismatch { expected: u64, found: u64 },

    #[error("unsupported transaction type {0:#x}")]
    UnsupportedType(u8),
}
