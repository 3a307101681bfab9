//! chainsync-core: confirmation-lagged block follower.
//!
//! # Architecture
//!
//! ```text
//! Coordinator (loop, CancellationToken)
//!     ├── SyncCursor        (store height + source head → safe height)
//!     ├── CatchUpScheduler  (bounded window of heights, or idle)
//!     ├── BlockFetcher ×W   (one JoinSet task per height, SourcePool checkout)
//!     └── Store             (idempotent per-height upsert: memory / SQLite / Postgres)
//! ```
//!
//! Everything the engine talks to sits behind a trait: [`ChainSource`] for
//! the remote ledger, [`Store`] and [`BlockReader`] for persistence.

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod fetcher;
pub mod pool;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::Backoff;
pub use config::{
    BackoffConfig, CoordinatorState, DecodePolicy, RpcConfig, SyncConfig, SyncConfigBuilder,
};
pub use coordinator::{Coordinator, SyncReport};
pub use cursor::{SyncCursor, SyncPosition};
pub use error::{DecodeError, SyncError};
pub use fetcher::BlockFetcher;
pub use pool::{PooledSource, SourcePool};
pub use scheduler::{CatchUpScheduler, Plan, SyncWindow};
pub use source::ChainSource;
pub use store::{BlockReader, MemoryStore, Store};
pub use types::{
    Block, BlockHeader, DecodeFailure, DecodedTransaction, FetchedBlock, Log, SourceBlock,
    SourceReceipt, Transaction, UpsertOutcome,
};
