use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::backend::{BackendError, StorageBackend, TableRows, TableWrite};
use super::fs_backend::FsBackend;
use super::mem_backend::MemBackend;
use super::records::{FavoriteEdge, Record, Table};
use crate::error::{Error, Result, WriteOp};

fn decode<R: Record>(value: &serde_json::Value) -> Result<R> {
    serde_json::from_value(value.clone()).map_err(|e| Error::ReadFailed {
        table: R::TABLE.name().to_string(),
        reason: e.to_string(),
    })
}

/// Embedded structured store: one table per entity family, held in memory
/// and written through to a [`StorageBackend`].
///
/// Each table has its own lock. Writes touching several tables lock them in
/// `Table` order, so unrelated tables never wait on each other and
/// overlapping writes are serialized. A failed commit leaves the in-memory
/// tables untouched; readers never observe part of a batch.
///
/// Backend commits run on the blocking pool together with the in-memory
/// swap, so dropping a write future never leaves memory behind the disk.
pub struct RecordStore {
    backend: Arc<dyn StorageBackend>,
    tables: Vec<Arc<Mutex<TableRows>>>,
}

impl RecordStore {
    pub fn open(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        backend.recover().map_err(|e| Error::ReadFailed {
            table: "journal".to_string(),
            reason: e.to_string(),
        })?;

        let mut tables = Vec::with_capacity(Table::ALL.len());
        let mut total = 0;
        for table in Table::ALL {
            let rows = backend.load_table(table).map_err(|e| Error::ReadFailed {
                table: table.name().to_string(),
                reason: e.to_string(),
            })?;
            total += rows.len();
            tables.push(Arc::new(Mutex::new(rows)));
        }

        info!(rows = total, "Record store opened");
        Ok(Self { backend, tables })
    }

    /// Open a store persisted as JSON files under `dir`.
    pub fn open_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open(Arc::new(FsBackend::new(dir)))
    }

    /// A store that keeps nothing across restarts.
    pub fn in_memory() -> Self {
        let tables = Table::ALL
            .iter()
            .map(|_| Arc::new(Mutex::new(TableRows::new())))
            .collect();
        Self {
            backend: Arc::new(MemBackend::new()),
            tables,
        }
    }

    fn slot(&self, table: Table) -> &Arc<Mutex<TableRows>> {
        &self.tables[table.slot()]
    }

    async fn lock_tables(&self, tables: &[Table]) -> (Vec<Table>, Vec<OwnedMutexGuard<TableRows>>) {
        let ordered: Vec<Table> = tables.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for table in &ordered {
            guards.push(Arc::clone(self.slot(*table)).lock_owned().await);
        }
        (ordered, guards)
    }

    /// Run `f` against a consistent view of `tables`, then commit whatever it
    /// changed as one atomic write.
    ///
    /// `operation` and `key` identify the write in `PersistenceFailed`.
    pub async fn transact<T>(
        &self,
        operation: WriteOp,
        key: &str,
        tables: &[Table],
        f: impl FnOnce(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        let (ordered, mut guards) = self.lock_tables(tables).await;

        let staged = ordered
            .iter()
            .zip(guards.iter())
            .map(|(table, rows)| (*table, (**rows).clone()))
            .collect();
        let mut txn = Transaction {
            operation,
            key: key.to_string(),
            staged,
            dirty: BTreeSet::new(),
        };

        let output = f(&mut txn)?;
        if txn.dirty.is_empty() {
            return Ok(output);
        }

        let writes: Vec<TableWrite> = txn
            .dirty
            .iter()
            .filter_map(|table| {
                txn.staged.remove(table).map(|rows| TableWrite {
                    table: *table,
                    rows,
                })
            })
            .collect();

        let backend = Arc::clone(&self.backend);
        let committed = tokio::task::spawn_blocking(move || {
            backend.commit(&writes)?;
            for write in writes {
                if let Some(pos) = ordered.iter().position(|t| *t == write.table) {
                    *guards[pos] = write.rows;
                }
            }
            Ok::<(), BackendError>(())
        })
        .await;

        match committed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(operation = %operation, key, error = %e, "Record store write failed");
                return Err(Error::persistence(operation, key, e));
            }
            Err(e) => {
                error!(operation = %operation, key, error = %e, "Record store commit task failed");
                return Err(Error::persistence(operation, key, e));
            }
        }

        debug!(operation = %operation, key, "Record store write committed");
        Ok(output)
    }

    /// Read-only variant of [`transact`](Self::transact): a consistent view
    /// across several tables.
    pub async fn read<T>(&self, tables: &[Table], f: impl FnOnce(&ReadView<'_>) -> Result<T>) -> Result<T> {
        let (ordered, guards) = self.lock_tables(tables).await;
        let view = ReadView {
            tables: ordered.iter().copied().zip(guards.iter().map(|g| &**g)).collect(),
        };
        f(&view)
    }

    // ===== Reads =====

    pub async fn get<R: Record>(&self, key: &str) -> Result<Option<R>> {
        let rows = self.slot(R::TABLE).lock().await;
        rows.get(key).map(decode::<R>).transpose()
    }

    pub async fn query<R: Record>(&self, predicate: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        let rows = self.slot(R::TABLE).lock().await;
        let mut matched = Vec::new();
        for value in rows.values() {
            let record = decode::<R>(value)?;
            if predicate(&record) {
                matched.push(record);
            }
        }
        Ok(matched)
    }

    pub async fn all<R: Record>(&self) -> Result<Vec<R>> {
        self.query(|_: &R| true).await
    }

    pub async fn count<R: Record>(&self) -> usize {
        self.slot(R::TABLE).lock().await.len()
    }

    // ===== Writes =====

    /// Insert or replace by identity key.
    pub async fn upsert<R: Record>(&self, record: &R) -> Result<()> {
        let key = record.key();
        self.transact(WriteOp::Upsert, &key, &[R::TABLE], |txn| txn.put(record))
            .await
    }

    /// Upsert several records of one table atomically.
    pub async fn upsert_all<R: Record>(&self, records: &[R]) -> Result<()> {
        let label = format!("{} x{}", R::TABLE, records.len());
        self.transact(WriteOp::Batch, &label, &[R::TABLE], |txn| {
            records.iter().try_for_each(|record| txn.put(record))
        })
        .await
    }

    /// Remove a record. Returns whether it existed; removing a missing key
    /// is not an error.
    pub async fn delete<R: Record>(&self, key: &str) -> Result<bool> {
        self.transact(WriteOp::Delete, key, &[R::TABLE], |txn| txn.delete::<R>(key))
            .await
    }

    /// Transactional read-modify-write of one record. `f` receives the
    /// current record (if any) and returns the replacement; `None` deletes.
    pub async fn modify<R: Record>(
        &self,
        key: &str,
        f: impl FnOnce(Option<R>) -> Option<R>,
    ) -> Result<Option<R>> {
        self.transact(WriteOp::Modify, key, &[R::TABLE], |txn| {
            let current = txn.get::<R>(key)?;
            match f(current) {
                Some(next) => {
                    if next.key() != key {
                        return Err(Error::persistence(
                            WriteOp::Modify,
                            key,
                            format!("identity changed to {}", next.key()),
                        ));
                    }
                    txn.put(&next)?;
                    Ok(Some(next))
                }
                None => {
                    txn.delete::<R>(key)?;
                    Ok(None)
                }
            }
        })
        .await
    }

    /// Apply a batch of heterogeneous writes atomically.
    pub async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.ops.is_empty() {
            return Ok(());
        }
        let tables: Vec<Table> = batch.ops.iter().map(BatchOp::table).collect();
        let label = batch.label.clone();
        self.transact(WriteOp::Batch, &label, &tables, move |txn| {
            for op in batch.ops {
                match op {
                    BatchOp::Put { table, key, value } => txn.put_raw(table, key, value)?,
                    BatchOp::Delete { table, key } => {
                        txn.delete_raw(table, &key)?;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Add the edge if absent, remove it if present. Returns whether the
    /// vendor is a favorite afterwards. Check and write happen under the
    /// favorites table lock.
    pub async fn toggle_favorite(&self, edge: &FavoriteEdge) -> Result<bool> {
        let key = edge.key();
        let favorited = self
            .transact(WriteOp::Toggle, &key, &[Table::Favorites], |txn| {
                if txn.delete::<FavoriteEdge>(&key)? {
                    Ok(false)
                } else {
                    txn.put(edge)?;
                    Ok(true)
                }
            })
            .await?;
        debug!(key = %key, favorited, "Favorite toggled");
        Ok(favorited)
    }
}

/// Staged copy of the locked tables inside [`RecordStore::transact`].
pub struct Transaction {
    operation: WriteOp,
    key: String,
    staged: BTreeMap<Table, TableRows>,
    dirty: BTreeSet<Table>,
}

impl Transaction {
    fn not_locked(&self, table: Table) -> Error {
        Error::persistence(
            self.operation,
            self.key.clone(),
            format!("table {} is not part of this transaction", table),
        )
    }

    fn rows(&self, table: Table) -> Result<&TableRows> {
        self.staged.get(&table).ok_or_else(|| self.not_locked(table))
    }

    fn rows_mut(&mut self, table: Table) -> Result<&mut TableRows> {
        if !self.staged.contains_key(&table) {
            return Err(self.not_locked(table));
        }
        self.dirty.insert(table);
        Ok(self.staged.entry(table).or_default())
    }

    pub fn get<R: Record>(&self, key: &str) -> Result<Option<R>> {
        self.rows(R::TABLE)?.get(key).map(decode::<R>).transpose()
    }

    pub fn find<R: Record>(&self, predicate: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        let mut matched = Vec::new();
        for value in self.rows(R::TABLE)?.values() {
            let record = decode::<R>(value)?;
            if predicate(&record) {
                matched.push(record);
            }
        }
        Ok(matched)
    }

    pub fn put<R: Record>(&mut self, record: &R) -> Result<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| Error::persistence(self.operation, record.key(), e))?;
        self.put_raw(R::TABLE, record.key(), value)
    }

    pub fn delete<R: Record>(&mut self, key: &str) -> Result<bool> {
        self.delete_raw(R::TABLE, key)
    }

    /// Delete every record of `R` matching `predicate`. Returns the count.
    pub fn delete_where<R: Record>(&mut self, predicate: impl Fn(&R) -> bool) -> Result<usize> {
        let doomed: Vec<String> = self
            .find::<R>(predicate)?
            .iter()
            .map(|record| record.key())
            .collect();
        for key in &doomed {
            self.delete_raw(R::TABLE, key)?;
        }
        Ok(doomed.len())
    }

    fn put_raw(&mut self, table: Table, key: String, value: serde_json::Value) -> Result<()> {
        self.rows_mut(table)?.insert(key, value);
        Ok(())
    }

    fn delete_raw(&mut self, table: Table, key: &str) -> Result<bool> {
        if !self.rows(table)?.contains_key(key) {
            return Ok(false);
        }
        Ok(self.rows_mut(table)?.remove(key).is_some())
    }
}

/// Locked, read-only tables inside [`RecordStore::read`].
pub struct ReadView<'a> {
    tables: BTreeMap<Table, &'a TableRows>,
}

impl ReadView<'_> {
    pub fn get<R: Record>(&self, key: &str) -> Result<Option<R>> {
        match self.tables.get(&R::TABLE) {
            Some(rows) => rows.get(key).map(decode::<R>).transpose(),
            None => Ok(None),
        }
    }

    pub fn find<R: Record>(&self, predicate: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        let Some(rows) = self.tables.get(&R::TABLE) else {
            return Ok(Vec::new());
        };
        let mut matched = Vec::new();
        for value in rows.values() {
            let record = decode::<R>(value)?;
            if predicate(&record) {
                matched.push(record);
            }
        }
        Ok(matched)
    }
}

enum BatchOp {
    Put {
        table: Table,
        key: String,
        value: serde_json::Value,
    },
    Delete {
        table: Table,
        key: String,
    },
}

impl BatchOp {
    fn table(&self) -> Table {
        match self {
            BatchOp::Put { table, .. } | BatchOp::Delete { table, .. } => *table,
        }
    }
}

/// Writes collected up front and committed together with
/// [`RecordStore::commit`].
pub struct WriteBatch {
    label: String,
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// `label` identifies the batch in errors and logs.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ops: Vec::new(),
        }
    }

    pub fn upsert<R: Record>(&mut self, record: &R) -> Result<&mut Self> {
        let value = serde_json::to_value(record)
            .map_err(|e| Error::persistence(WriteOp::Batch, record.key(), e))?;
        self.ops.push(BatchOp::Put {
            table: R::TABLE,
            key: record.key(),
            value,
        });
        Ok(self)
    }

    pub fn delete<R: Record>(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            table: R::TABLE,
            key: key.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
