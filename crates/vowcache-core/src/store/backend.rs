use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::records::Table;

/// Rows of one table, keyed by identity key.
pub type TableRows = BTreeMap<String, serde_json::Value>;

/// Full replacement contents for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableWrite {
    pub table: Table,
    pub rows: TableRows,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Raw table I/O underneath the record store.
///
/// The backend handles *how* tables are stored; `RecordStore` handles
/// locking, identity and the domain operations on top.
pub trait StorageBackend: Send + Sync {
    /// Finish or discard any write interrupted by a previous crash.
    /// Called once before the first `load_table`.
    fn recover(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Load all rows of a table. A table never written is empty.
    fn load_table(&self, table: Table) -> Result<TableRows, BackendError>;

    /// Replace the given tables. MUST be atomic across all of `writes`:
    /// after a crash either every table reflects the commit or none does.
    fn commit(&self, writes: &[TableWrite]) -> Result<(), BackendError>;
}
