//! Column conversions shared by the SQL backends.

use serde::de::DeserializeOwned;
use serde::Serialize;

use chainsync_core::SyncError;

pub(crate) fn db_err(e: sqlx::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

/// Heights, nonces and timestamps are stored as signed 64-bit integers.
pub(crate) fn to_i64(value: u64, column: &str) -> Result<i64, SyncError> {
    i64::try_from(value)
        .map_err(|_| SyncError::Storage(format!("{column} {value} does not fit in BIGINT")))
}

pub(crate) fn to_u64(value: i64, column: &str) -> Result<u64, SyncError> {
    u64::try_from(value).map_err(|_| SyncError::Storage(format!("negative {column} {value}")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, SyncError> {
    serde_json::to_string(value).map_err(|e| SyncError::Storage(e.to_string()))
}

pub(crate) fn from_json<T: DeserializeOwned>(text: &str, column: &str) -> Result<T, SyncError> {
    serde_json::from_str(text).map_err(|e| SyncError::Storage(format!("corrupt {column}: {e}")))
}

/// Unix seconds recorded in `indexed_at`.
pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
