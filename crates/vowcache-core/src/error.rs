//! Error types surfaced by the cache and record store.
//!
//! Lower layers have their own errors (`remote::FetchError`,
//! `store::BackendError`); they are folded into [`Error`] at the component
//! boundary so callers only ever match on one type. `Error` is `Clone` because
//! a single failed download is shared by every caller awaiting it, and because
//! sync slices keep the last error around for display.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Download failed; the cache was left untouched.
    #[error("Fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    /// Write to the record store failed; nothing from the write is visible.
    #[error("{operation} failed for {key}: {reason}")]
    PersistenceFailed {
        operation: WriteOp,
        key: String,
        reason: String,
    },

    #[error("Failed to read {table}: {reason}")]
    ReadFailed { table: String, reason: String },

    /// Local cache directory could not be written or cleared.
    #[error("Cache storage error at {}: {reason}", path.display())]
    CacheStorage { path: PathBuf, reason: String },
}

/// Coarse classification for display and for policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FetchFailed,
    PersistenceFailed,
    ReadFailed,
    CacheStorage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FetchFailed { .. } => ErrorKind::FetchFailed,
            Error::PersistenceFailed { .. } => ErrorKind::PersistenceFailed,
            Error::ReadFailed { .. } => ErrorKind::ReadFailed,
            Error::CacheStorage { .. } => ErrorKind::CacheStorage,
        }
    }

    pub(crate) fn persistence(operation: WriteOp, key: impl Into<String>, reason: impl ToString) -> Self {
        Error::PersistenceFailed {
            operation,
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn cache_storage(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CacheStorage {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// The write operation that failed, carried in `PersistenceFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Upsert,
    Delete,
    Toggle,
    Modify,
    Batch,
}

impl std::fmt::Display for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WriteOp::Upsert => "Upsert",
            WriteOp::Delete => "Delete",
            WriteOp::Toggle => "Toggle",
            WriteOp::Modify => "Modify",
            WriteOp::Batch => "Batch write",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let err = Error::FetchFailed {
            url: "https://img/a.jpg".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::FetchFailed);

        let err = Error::persistence(WriteOp::Toggle, "u1#v1", "disk full");
        assert_eq!(err.kind(), ErrorKind::PersistenceFailed);
    }

    #[test]
    fn test_persistence_message_names_operation_and_key() {
        let err = Error::persistence(WriteOp::Batch, "vendor:v1", "disk full");
        assert_eq!(err.to_string(), "Batch write failed for vendor:v1: disk full");
    }
}
