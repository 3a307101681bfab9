//! chainsync-storage: durable stores for chainsync.
//!
//! Backends:
//! - `memory:`: [`MemoryStore`] from `chainsync-core` (tests, ephemeral runs)
//! - [`sqlite`]: SQLite via `sqlx` (feature `sqlite`)
//! - [`postgres`]: PostgreSQL via `sqlx` (feature `postgres`)
//!
//! [`open_store`] picks the backend from the database URL.

use std::sync::Arc;

use chainsync_core::{BlockReader, Store, SyncError};

pub use chainsync_core::MemoryStore;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod rows;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

/// An opened store, usable as both the write and the read side.
#[derive(Clone)]
pub enum StoreBackend {
    Memory(Arc<MemoryStore>),
    #[cfg(feature = "sqlite")]
    Sqlite(Arc<sqlite::SqliteStore>),
    #[cfg(feature = "postgres")]
    Postgres(Arc<postgres::PostgresStore>),
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres",
        }
    }

    pub fn writer(&self) -> Arc<dyn Store> {
        match self {
            Self::Memory(s) => s.clone(),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(s) => s.clone(),
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.clone(),
        }
    }

    pub fn reader(&self) -> Arc<dyn BlockReader> {
        match self {
            Self::Memory(s) => s.clone(),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(s) => s.clone(),
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => s.clone(),
        }
    }
}

impl std::fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StoreBackend").field(&self.name()).finish()
    }
}

/// Open the store named by `url`: `memory:`, `sqlite:<path>` or
/// `postgres://…` / `postgresql://…`.
///
/// Unknown schemes, and schemes whose feature is not compiled in, are
/// configuration errors.
pub async fn open_store(url: &str) -> Result<StoreBackend, SyncError> {
    let url = url.trim();
    if url == "memory:" || url == "memory" {
        tracing::warn!("using in-memory store; nothing will survive a restart");
        return Ok(StoreBackend::Memory(Arc::new(MemoryStore::new())));
    }

    if url.starts_with("sqlite:") {
        #[cfg(feature = "sqlite")]
        {
            let store = if url == "sqlite::memory:" {
                sqlite::SqliteStore::in_memory().await?
            } else {
                sqlite::SqliteStore::open(url).await?
            };
            return Ok(StoreBackend::Sqlite(Arc::new(store)));
        }
        #[cfg(not(feature = "sqlite"))]
        return Err(SyncError::Config(
            "sqlite support is not compiled in (enable the `sqlite` feature)".into(),
        ));
    }

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        #[cfg(feature = "postgres")]
        {
            let store = postgres::PostgresStore::connect(url).await?;
            return Ok(StoreBackend::Postgres(Arc::new(store)));
        }
        #[cfg(not(feature = "postgres"))]
        return Err(SyncError::Config(
            "postgres support is not compiled in (enable the `postgres` feature)".into(),
        ));
    }

    Err(SyncError::Config(format!("unsupported database url: {url}")))
}
