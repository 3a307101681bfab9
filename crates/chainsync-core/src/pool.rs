//! Bounded pool of chain source handles shared by fetch tasks.
//!
//! Handles are handed out round-robin. A checkout holds a semaphore permit
//! until the returned [`PooledSource`] is dropped, so the permit is released
//! on success, error and task abort alike.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::SyncError;
use crate::source::ChainSource;

/// Round-robin pool of [`ChainSource`] handles with bounded checkouts.
pub struct SourcePool {
    sources: Vec<Arc<dyn ChainSource>>,
    permits: Arc<Semaphore>,
    cursor: AtomicUsize,
    capacity: usize,
}

impl SourcePool {
    /// Build a pool allowing at most `capacity` concurrent checkouts.
    pub fn new(sources: Vec<Arc<dyn ChainSource>>, capacity: usize) -> Result<Self, SyncError> {
        if sources.is_empty() {
            return Err(SyncError::Config("source pool needs at least one source".into()));
        }
        let capacity = capacity.max(1);
        Ok(Self {
            sources,
            permits: Arc::new(Semaphore::new(capacity)),
            cursor: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Pool over a single shared handle.
    pub fn shared(source: Arc<dyn ChainSource>, capacity: usize) -> Self {
        Self {
            sources: vec![source],
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            cursor: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Checkouts that could be granted right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot and borrow the next handle.
    pub async fn checkout(&self) -> Result<PooledSource, SyncError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.sources.len();
        Ok(PooledSource {
            source: self.sources[idx].clone(),
            _permit: permit,
        })
    }
}

/// A borrowed source handle; the slot is returned on drop.
pub struct PooledSource {
    source: Arc<dyn ChainSource>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for SourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePool")
            .field("sources", &self.sources.len())
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl std::fmt::Debug for PooledSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSource").finish_non_exhaustive()
    }
}

impl Deref for PooledSource {
    type Target = dyn ChainSource;

    fn deref(&self) -> &Self::Target {
        self.source.as_ref()
    }
}
