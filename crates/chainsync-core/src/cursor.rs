//! Sync cursor: where the engine stands relative to the chain.
//!
//! The cursor is not kept in memory between cycles: it is re-derived from
//! the store's last persisted height and the source's head height every
//! time, so a restarted process resumes exactly where the store left off.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::source::ChainSource;
use crate::store::Store;

/// One cycle's view of progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPosition {
    /// Head height reported by the source.
    pub head_height: u64,
    /// `head_height - confirmation_depth`; nothing above this is fetched.
    pub safe_height: u64,
    /// Highest persisted height, or the start height if the store is empty.
    pub last_persisted: u64,
    /// `true` if `last_persisted` came from the store.
    pub resumed: bool,
}

impl SyncPosition {
    /// Heights between the cursor and the safe height.
    pub fn lag(&self) -> u64 {
        self.safe_height.saturating_sub(self.last_persisted)
    }
}

/// Derives [`SyncPosition`] from a store and a source.
#[derive(Debug, Clone, Copy)]
pub struct SyncCursor {
    confirmation_depth: u64,
    start_height: u64,
}

impl SyncCursor {
    pub fn new(confirmation_depth: u64, start_height: u64) -> Self {
        Self {
            confirmation_depth,
            start_height,
        }
    }

    pub fn confirmation_depth(&self) -> u64 {
        self.confirmation_depth
    }

    /// Highest height considered final for a given head.
    pub fn safe_height(&self, head_height: u64) -> u64 {
        head_height.saturating_sub(self.confirmation_depth)
    }

    /// Combine a stored height (if any) with a head height.
    pub fn position_from(&self, stored: Option<u64>, head_height: u64) -> SyncPosition {
        let (last_persisted, resumed) = match stored {
            Some(h) => (h, true),
            None => (self.start_height, false),
        };
        SyncPosition {
            head_height,
            safe_height: self.safe_height(head_height),
            last_persisted,
            resumed,
        }
    }

    /// Read both sides and compute the current position.
    pub async fn position(
        &self,
        source: &dyn ChainSource,
        store: &dyn Store,
    ) -> Result<SyncPosition, SyncError> {
        let stored = store.last_persisted_height().await?;
        let head = source.head_height().await?;
        let position = self.position_from(stored, head);
        tracing::debug!(
            head = position.head_height,
            safe = position.safe_height,
            last_persisted = position.last_persisted,
            resumed = position.resumed,
            "sync position"
        );
        Ok(position)
    }
}
