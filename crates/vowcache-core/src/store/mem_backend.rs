use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::backend::{BackendError, StorageBackend, TableRows, TableWrite};
use super::records::Table;

/// In-memory storage backend for tests and previews.
///
/// Writes can be made to fail on demand to exercise the reconciliation path
/// (e.g. a device that is out of space).
#[derive(Default)]
pub struct MemBackend {
    tables: Mutex<HashMap<Table, TableRows>>,
    fail_writes: AtomicBool,
    commits: AtomicUsize,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl StorageBackend for MemBackend {
    fn load_table(&self, table: Table) -> Result<TableRows, BackendError> {
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        Ok(tables.get(&table).cloned().unwrap_or_default())
    }

    fn commit(&self, writes: &[TableWrite]) -> Result<(), BackendError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("simulated write failure".to_string()));
        }
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        for write in writes {
            tables.insert(write.table, write.rows.clone());
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
