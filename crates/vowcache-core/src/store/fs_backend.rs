use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use super::backend::{BackendError, StorageBackend, TableRows, TableWrite};
use super::records::Table;

/// Pending multi-table commit, replayed by `recover`.
const JOURNAL_FILE: &str = "journal.json";

/// One JSON file per table under a root directory.
///
/// Single-table commits are a temp-file write plus rename. Multi-table
/// commits write the whole batch to a journal first, then each table, then
/// remove the journal. A batch that fails part way is rolled back and its
/// journal removed, so `recover` only ever replays a batch that was
/// interrupted by a crash.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, table: Table) -> PathBuf {
        self.root.join(format!("{}.json", table.name()))
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    fn ensure_dir(&self) -> Result<(), BackendError> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
        }
        Ok(())
    }

    fn write_atomic(&self, path: &Path, contents: &str) -> Result<(), BackendError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("table");
        let tmp = self
            .root
            .join(format!(".{}.{:016x}.tmp", name, rand::random::<u64>()));

        fs::write(&tmp, contents)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn apply(&self, writes: &[TableWrite]) -> Result<(), BackendError> {
        for write in writes {
            let contents = serde_json::to_string_pretty(&write.rows)?;
            self.write_atomic(&self.table_path(write.table), &contents)?;
        }
        Ok(())
    }

    /// Raw file contents of each table, `None` where the file is absent.
    fn snapshot(&self, writes: &[TableWrite]) -> Result<Vec<(Table, Option<String>)>, BackendError> {
        writes
            .iter()
            .map(|write| match fs::read_to_string(self.table_path(write.table)) {
                Ok(contents) => Ok((write.table, Some(contents))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((write.table, None)),
                Err(e) => Err(e.into()),
            })
            .collect()
    }

    /// Put tables back as `snapshot` found them. Best effort: every table is
    /// attempted and the first failure is returned.
    fn restore(&self, snapshot: &[(Table, Option<String>)]) -> Result<(), BackendError> {
        let mut first_error = None;
        for (table, contents) in snapshot {
            let path = self.table_path(*table);
            let result = match contents {
                Some(contents) => self.write_atomic(&path, contents),
                None => remove_if_exists(&path),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn clear_journal(&self) -> Result<(), BackendError> {
        remove_if_exists(&self.journal_path())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), BackendError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl StorageBackend for FsBackend {
    fn recover(&self) -> Result<(), BackendError> {
        let journal = self.journal_path();
        if !journal.exists() {
            return Ok(());
        }

        let contents = fs::read_to_string(&journal)?;
        match serde_json::from_str::<Vec<TableWrite>>(&contents) {
            Ok(writes) => {
                info!(tables = writes.len(), "Replaying interrupted batch write");
                self.apply(&writes)?;
            }
            Err(e) => {
                // The journal is renamed into place whole, so this is not a
                // torn write; nothing from it was ever applied.
                warn!(error = %e, "Discarding unreadable batch journal");
            }
        }
        fs::remove_file(&journal)?;
        Ok(())
    }

    fn load_table(&self, table: Table) -> Result<TableRows, BackendError> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(TableRows::new());
        }
        let contents = fs::read_to_string(&path)?;
        let rows: TableRows = serde_json::from_str(&contents)?;
        debug!(table = %table, rows = rows.len(), "Table loaded");
        Ok(rows)
    }

    fn commit(&self, writes: &[TableWrite]) -> Result<(), BackendError> {
        self.ensure_dir()?;

        // A journal still present here belongs to an earlier commit of this
        // process. Left in place, `recover` would replay it over this write.
        self.clear_journal()?;

        if writes.len() <= 1 {
            return self.apply(writes);
        }

        let previous = self.snapshot(writes)?;
        self.write_atomic(&self.journal_path(), &serde_json::to_string(writes)?)?;

        if let Err(e) = self.apply(writes) {
            if let Err(restore) = self.restore(&previous) {
                error!(error = %restore, "Failed to roll back partial batch write");
            }
            if let Err(clear) = self.clear_journal() {
                warn!(error = %clear, "Failed to remove journal of rolled back batch");
            }
            return Err(e);
        }

        // Every table is written; a journal that refuses to go is retried by
        // the next commit.
        if let Err(e) = self.clear_journal() {
            warn!(error = %e, "Batch committed but journal not removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(table: Table, key: &str) -> TableWrite {
        let mut rows = TableRows::new();
        rows.insert(key.to_string(), json!({ "id": key }));
        TableWrite { table, rows }
    }

    #[test]
    fn test_missing_table_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().join("records"));
        assert!(backend.load_table(Table::Vendors).unwrap().is_empty());
    }

    #[test]
    fn test_commit_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().join("records"));
        backend
            .commit(&[write(Table::Vendors, "v1"), write(Table::VendorImages, "v1#0")])
            .unwrap();

        assert!(backend.load_table(Table::Vendors).unwrap().contains_key("v1"));
        assert!(backend.load_table(Table::VendorImages).unwrap().contains_key("v1#0"));
        assert!(!backend.journal_path().exists());
    }

    #[test]
    fn test_recover_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let writes = vec![write(Table::Vendors, "v1"), write(Table::Reviews, "r1")];
        fs::write(backend.journal_path(), serde_json::to_string(&writes).unwrap()).unwrap();

        backend.recover().unwrap();
        assert!(backend.load_table(Table::Vendors).unwrap().contains_key("v1"));
        assert!(backend.load_table(Table::Reviews).unwrap().contains_key("r1"));
        assert!(!backend.journal_path().exists());
    }

    #[test]
    fn test_recover_discards_unreadable_journal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        fs::write(backend.journal_path(), "[{").unwrap();

        backend.recover().unwrap();
        assert!(!backend.journal_path().exists());
        assert!(backend.load_table(Table::Vendors).unwrap().is_empty());
    }

    #[test]
    fn test_failed_batch_rolls_back_and_drops_journal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let mut old = write(Table::Vendors, "v1");
        old.rows.insert("v1".to_string(), json!({ "id": "v1", "name": "Old" }));
        backend.commit(&[old]).unwrap();

        // A directory where the reviews table belongs fails the batch
        let reviews = backend.table_path(Table::Reviews);
        fs::create_dir(&reviews).unwrap();
        let mut new = write(Table::Vendors, "v1");
        new.rows.insert("v1".to_string(), json!({ "id": "v1", "name": "Batch" }));
        let result = backend.commit(&[new, write(Table::Reviews, "r1")]);
        assert!(result.is_err());

        assert_eq!(backend.load_table(Table::Vendors).unwrap()["v1"]["name"], "Old");
        assert!(!backend.journal_path().exists());

        // A later write must survive a restart untouched by the failed batch
        fs::remove_dir(&reviews).unwrap();
        let mut later = write(Table::Vendors, "v1");
        later.rows.insert("v1".to_string(), json!({ "id": "v1", "name": "New" }));
        backend.commit(&[later]).unwrap();

        let reopened = FsBackend::new(dir.path());
        reopened.recover().unwrap();
        assert_eq!(reopened.load_table(Table::Vendors).unwrap()["v1"]["name"], "New");
        assert!(reopened.load_table(Table::Reviews).unwrap().is_empty());
    }

    #[test]
    fn test_failed_batch_removes_tables_it_created() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        fs::create_dir(backend.table_path(Table::Reviews)).unwrap();

        let result = backend.commit(&[write(Table::Vendors, "v1"), write(Table::Reviews, "r1")]);
        assert!(result.is_err());
        assert!(!backend.table_path(Table::Vendors).exists());
        assert!(!backend.journal_path().exists());
    }

    #[test]
    fn test_commit_clears_stale_journal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let stale = vec![write(Table::Vendors, "stale"), write(Table::Reviews, "r1")];
        fs::write(backend.journal_path(), serde_json::to_string(&stale).unwrap()).unwrap();

        backend.commit(&[write(Table::Vendors, "v1")]).unwrap();
        assert!(!backend.journal_path().exists());

        backend.recover().unwrap();
        let vendors = backend.load_table(Table::Vendors).unwrap();
        assert!(vendors.contains_key("v1"));
        assert!(!vendors.contains_key("stale"));
    }

    #[test]
    fn test_restore_puts_tables_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        backend.commit(&[write(Table::Vendors, "v1")]).unwrap();

        let batch = [write(Table::Vendors, "v2"), write(Table::Reviews, "r1")];
        let previous = backend.snapshot(&batch).unwrap();
        backend.apply(&batch).unwrap();

        backend.restore(&previous).unwrap();
        let vendors = backend.load_table(Table::Vendors).unwrap();
        assert!(vendors.contains_key("v1"));
        assert!(!vendors.contains_key("v2"));
        assert!(!backend.table_path(Table::Reviews).exists());
    }
}
