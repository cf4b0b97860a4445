//! # Connections
//!
//! A [`Connection`] is the consumer handle: it owns at most one open
//! transaction and the per-table bookkeeping for it.
//!
//! ## Transactions
//!
//! - `begin` opens an explicit transaction that lasts until `commit` or
//!   `rollback`, committing whatever transaction was already open
//! - a statement issued outside one runs in an auto transaction that commits
//!   as soon as the statement finishes, unless auto-commit is switched off, in
//!   which case the statement opens an explicit transaction
//! - the first write to a table takes its table lock exclusively; the lock is
//!   held until the transaction ends
//!
//! ## Row Lifecycle
//!
//! Inserted rows are InTransaction and listed in the table's insert bitmap.
//! Deleting a committed row only lists it in the delete bitmap; the row stays
//! Committed (and visible to everyone else) until commit frees it. Deleting a
//! row this transaction inserted frees it on the spot.
//!
//! In-memory tables written by an auto transaction skip the bitmaps: rows go
//! straight to Committed and deletes free immediately, as no other party can
//! observe the difference.
//!
//! ## Commit
//!
//! Per database: log the transaction to the WAL, then flip insert-bitmap rows
//! to Committed and free delete-bitmap rows, all under the WAL lock. Then every
//! table lock is released.

use std::collections::BTreeMap;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{trace, warn};

use super::bitmap::RowBitmap;
use super::lock::LockLevel;
use super::visibility::{Hiding, TxnView, Visibility};
use crate::database::{DbId, PendingChanges, StoreReadGuard, Table, TableId, TableStore};
use crate::error::CoreError;
use crate::index::HashMatches;
use crate::storage::{RowId, RowState};

pub type ConnectionId = u64;

/// What a commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// `(database, commit id)` for every WAL record written.
    pub commit_ids: SmallVec<[(DbId, u64); 2]>,
    pub inserted: usize,
    pub deleted: usize,
}

#[derive(Debug)]
struct TableTxn {
    table: Arc<Table>,
    lock: Option<LockLevel>,
    inserted: RowBitmap,
    deleted: RowBitmap,
}

impl TableTxn {
    fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            lock: None,
            inserted: RowBitmap::new(),
            deleted: RowBitmap::new(),
        }
    }

    fn view(&self) -> TxnView<'_> {
        TxnView::new(&self.inserted, &self.deleted)
    }

    fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.deleted.is_empty()
    }

    fn pending(&self) -> PendingChanges<'_> {
        PendingChanges {
            table: &self.table,
            inserted: &self.inserted,
            deleted: &self.deleted,
        }
    }
}

enum Removal {
    NotVisible,
    Deferred,
    Freed,
}

pub struct Connection {
    id: ConnectionId,
    auto_commit: bool,
    in_txn: bool,
    auto_txn: bool,
    tables: BTreeMap<(DbId, TableId), TableTxn>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("auto_commit", &self.auto_commit)
            .field("in_txn", &self.in_txn)
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(id: ConnectionId) -> Self {
        Self {
            id,
            auto_commit: true,
            in_txn: false,
            auto_txn: false,
            tables: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.in_txn
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) {
        self.auto_commit = auto_commit;
    }

    /// Opens an explicit transaction. A transaction already open is
    /// committed first; there is no nesting.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_txn {
            self.commit()?;
        }
        self.in_txn = true;
        self.auto_txn = false;
        trace!(conn = self.id, "transaction started");
        Ok(())
    }

    /// Returns true if the statement runs in an auto transaction that must be
    /// committed when it ends.
    fn begin_statement(&mut self) -> bool {
        if self.in_txn {
            return false;
        }
        self.in_txn = true;
        self.auto_txn = self.auto_commit;
        self.auto_txn
    }

    fn end_statement<T>(&mut self, auto: bool, result: Result<T>) -> Result<T> {
        if !auto {
            return result;
        }
        let committed = self.commit();
        let value = result?;
        committed?;
        Ok(value)
    }

    fn lock_table(&mut self, table: &Arc<Table>, level: LockLevel) -> Result<&mut TableTxn> {
        let entry = self
            .tables
            .entry((table.db_id(), table.id()))
            .or_insert_with(|| TableTxn::new(Arc::clone(table)));
        match entry.lock {
            Some(held) if held >= level => return Ok(entry),
            Some(held) => {
                // Upgrades go through release; two upgraders would deadlock.
                entry.table.unlock_txn(held);
                entry.lock = None;
            }
            None => {}
        }
        entry.table.lock_txn(level)?;
        entry.lock = Some(level);
        Ok(entry)
    }

    /// Takes the table lock shared until the transaction ends.
    pub fn rdlock_table(&mut self, table: &Arc<Table>) -> Result<()> {
        let auto = self.begin_statement();
        let result = self.lock_table(table, LockLevel::Shared).map(|_| ());
        self.end_statement(auto, result)
    }

    /// Takes the table lock exclusively until the transaction ends.
    pub fn wrlock_table(&mut self, table: &Arc<Table>) -> Result<()> {
        let auto = self.begin_statement();
        let result = self.lock_table(table, LockLevel::Exclusive).map(|_| ());
        self.end_statement(auto, result)
    }

    /// Stores a new row and indexes it. `row` must be exactly the table's row
    /// size; `var` is the row's variable-length data, if the table has any.
    pub fn insert(&mut self, table: &Arc<Table>, row: &[u8], var: Option<&[u8]>) -> Result<RowId> {
        let auto = self.begin_statement();
        let result = self.insert_in_txn(table, row, var);
        self.end_statement(auto, result)
    }

    /// Alias of [`Connection::insert`].
    pub fn allocate_row(&mut self, table: &Arc<Table>, row: &[u8], var: Option<&[u8]>) -> Result<RowId> {
        self.insert(table, row, var)
    }

    fn insert_in_txn(&mut self, table: &Arc<Table>, row: &[u8], var: Option<&[u8]>) -> Result<RowId> {
        let direct = table.is_in_memory() && self.auto_txn;
        let entry = self.lock_table(table, LockLevel::Exclusive)?;
        let mut store = table.write_store()?;
        if direct {
            return store.insert(row, var, RowState::Committed, &entry.view());
        }
        let id = store.insert(row, var, RowState::InTransaction, &entry.view())?;
        entry.inserted.insert(id);
        Ok(id)
    }

    /// Deletes a row visible to this connection. Returns false if there was
    /// no such row.
    pub fn delete(&mut self, table: &Arc<Table>, id: RowId) -> Result<bool> {
        let auto = self.begin_statement();
        let result = self
            .delete_in_txn(table, id)
            .map(|r| !matches!(r, Removal::NotVisible));
        self.end_statement(auto, result)
    }

    /// Alias of [`Connection::delete`].
    pub fn free_row(&mut self, table: &Arc<Table>, id: RowId) -> Result<bool> {
        self.delete(table, id)
    }

    fn delete_in_txn(&mut self, table: &Arc<Table>, id: RowId) -> Result<Removal> {
        let direct = table.is_in_memory() && self.auto_txn;
        let entry = self.lock_table(table, LockLevel::Exclusive)?;
        let mut store = table.write_store()?;
        let Some(state) = store.state(id) else {
            return Ok(Removal::NotVisible);
        };
        if !entry.view().is_visible(store.rows(), id) {
            return Ok(Removal::NotVisible);
        }
        if direct || state == RowState::InTransaction {
            store.remove(id);
            entry.inserted.remove(id);
            Ok(Removal::Freed)
        } else {
            entry.deleted.insert(id);
            Ok(Removal::Deferred)
        }
    }

    /// Replaces row `id` with a new row and returns the new row's id.
    ///
    /// Unique keys of the new row are vetted against every other visible row
    /// before anything changes.
    pub fn update(
        &mut self,
        table: &Arc<Table>,
        id: RowId,
        row: &[u8],
        var: Option<&[u8]>,
    ) -> Result<RowId> {
        let auto = self.begin_statement();
        let result = self.update_in_txn(table, id, row, var);
        self.end_statement(auto, result)
    }

    fn update_in_txn(&mut self, table: &Arc<Table>, id: RowId, row: &[u8], var: Option<&[u8]>) -> Result<RowId> {
        ensure!(
            row.len() == table.row_size(),
            "row is {} bytes, table '{}' rows are {}",
            row.len(),
            table.name(),
            table.row_size()
        );
        let direct = table.is_in_memory() && self.auto_txn;
        {
            let entry = self.lock_table(table, LockLevel::Exclusive)?;
            let mut store = table.write_store()?;
            let view = entry.view();
            let state = store.state(id);
            ensure!(
                state.is_some() && view.is_visible(store.rows(), id),
                "row {} of table '{}' is not visible",
                id,
                table.name()
            );
            if let Some((index, existing)) = store.find_conflict(row, &view, id) {
                bail!(CoreError::DuplicateKey {
                    index: index.to_string(),
                    existing,
                });
            }

            if direct || state == Some(RowState::InTransaction) {
                // The old slot is freed outright, so it goes only once the
                // replacement is fully stored.
                let target = if direct { RowState::Committed } else { RowState::InTransaction };
                let new_id = store.insert(row, var, target, &Hiding::new(&view, id))?;
                store.remove(id);
                entry.inserted.remove(id);
                if !direct {
                    entry.inserted.insert(new_id);
                }
                return Ok(new_id);
            }
        }

        self.delete_in_txn(table, id)?;
        match self.insert_in_txn(table, row, var) {
            Ok(new_id) => Ok(new_id),
            Err(e) => {
                if let Some(entry) = self.tables.get_mut(&(table.db_id(), table.id())) {
                    entry.deleted.remove(id);
                }
                Err(e)
            }
        }
    }

    /// True if row `id` is visible to this connection.
    pub fn is_visible(&self, table: &Table, id: RowId) -> Result<bool> {
        let store = table.read_store()?;
        if store.state(id).is_none() {
            return Ok(false);
        }
        Ok(self.view_of(table).is_visible(store.rows(), id))
    }

    fn view_of(&self, table: &Table) -> TxnView<'_> {
        self.tables
            .get(&(table.db_id(), table.id()))
            .map(TableTxn::view)
            .unwrap_or_else(TxnView::untouched)
    }

    /// Opens the table for reading in this connection's view. The storage
    /// read lock is held until the reader is dropped.
    pub fn read<'a>(&'a self, table: &'a Table) -> Result<TableReader<'a>> {
        Ok(TableReader {
            table,
            store: table.read_store()?,
            view: self.view_of(table),
        })
    }

    pub fn commit(&mut self) -> Result<CommitOutcome> {
        if !self.in_txn {
            return Ok(CommitOutcome::default());
        }
        let tables = std::mem::take(&mut self.tables);
        self.in_txn = false;
        self.auto_txn = false;

        let result = Self::commit_tables(&tables);
        Self::release(&tables);
        if let Ok(outcome) = &result {
            trace!(
                conn = self.id,
                inserted = outcome.inserted,
                deleted = outcome.deleted,
                "transaction committed"
            );
        }
        result
    }

    fn by_database(tables: &BTreeMap<(DbId, TableId), TableTxn>) -> BTreeMap<DbId, SmallVec<[&TableTxn; 4]>> {
        let mut groups: BTreeMap<DbId, SmallVec<[&TableTxn; 4]>> = BTreeMap::new();
        for ((db_id, _), txn) in tables {
            if txn.has_changes() {
                groups.entry(*db_id).or_default().push(txn);
            }
        }
        groups
    }

    fn commit_tables(tables: &BTreeMap<(DbId, TableId), TableTxn>) -> Result<CommitOutcome> {
        let mut outcome = CommitOutcome::default();
        for (db_id, group) in Self::by_database(tables) {
            let pending: SmallVec<[PendingChanges<'_>; 4]> = group.iter().map(|t| t.pending()).collect();
            for p in &pending {
                outcome.inserted += p.inserted.len();
                outcome.deleted += p.deleted.len();
            }
            match group[0].table.database() {
                Some(db) => {
                    if let Some(commit_id) = db.commit(&pending)? {
                        outcome.commit_ids.push((db_id, commit_id));
                    }
                }
                None => {
                    for p in &pending {
                        p.apply_commit()?;
                    }
                }
            }
        }
        Ok(outcome)
    }

    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_txn {
            return Ok(());
        }
        let tables = std::mem::take(&mut self.tables);
        self.in_txn = false;
        self.auto_txn = false;

        let mut result = Ok(());
        for (_, group) in Self::by_database(&tables) {
            let pending: SmallVec<[PendingChanges<'_>; 4]> = group.iter().map(|t| t.pending()).collect();
            let rolled = match group[0].table.database() {
                Some(db) => db.rollback(&pending),
                None => pending.iter().try_for_each(PendingChanges::apply_rollback),
            };
            if result.is_ok() {
                result = rolled;
            }
        }
        Self::release(&tables);
        trace!(conn = self.id, "transaction rolled back");
        result
    }

    fn release(tables: &BTreeMap<(DbId, TableId), TableTxn>) {
        for txn in tables.values() {
            if let Some(level) = txn.lock {
                txn.table.unlock_txn(level);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.in_txn {
            if let Err(e) = self.rollback() {
                warn!(conn = self.id, error = %e, "rollback on connection drop failed");
            }
        }
    }
}

/// A table opened for reading in one connection's view.
pub struct TableReader<'a> {
    table: &'a Table,
    store: StoreReadGuard<'a>,
    view: TxnView<'a>,
}

impl<'a> TableReader<'a> {
    pub fn table(&self) -> &Table {
        self.table
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    fn visible(&self, id: RowId) -> bool {
        self.store.state(id).is_some() && self.view.is_visible(self.store.rows(), id)
    }

    /// User bytes of `id`, if visible.
    pub fn row(&self, id: RowId) -> Option<&[u8]> {
        self.visible(id).then(|| self.store.row(id))
    }

    pub fn var_data(&self, id: RowId) -> Option<&[u8]> {
        if !self.visible(id) {
            return None;
        }
        self.store.var_data(id)
    }

    /// Every visible row in id order.
    pub fn scan(&self) -> Scan<'_> {
        Scan {
            store: &self.store,
            view: &self.view,
            next: 1,
            max: self.store.rows().max_id(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.scan().count()
    }

    /// Visible rows whose key in `index` equals `key`.
    pub fn lookup<'r>(&'r self, index: &str, key: &[&'r [u8]]) -> Result<HashMatches<'r, dyn Visibility + 'r>> {
        let Some(idx) = self.store.index(index) else {
            bail!("table '{}' has no index named '{}'", self.table.name(), index);
        };
        let view: &'r (dyn Visibility + 'r) = &self.view;
        Ok(idx.query(self.store.rows(), key, view))
    }

    /// [`TableReader::lookup`] keeping only rows every filter accepts. Each
    /// filter sees the row's full slot.
    pub fn lookup_filtered<'r>(
        &'r self,
        index: &str,
        key: &[&'r [u8]],
        filters: &'r [&'r dyn Fn(&[u8]) -> bool],
    ) -> Result<impl Iterator<Item = RowId> + 'r> {
        let Some(idx) = self.store.index(index) else {
            bail!("table '{}' has no index named '{}'", self.table.name(), index);
        };
        let view: &'r (dyn Visibility + 'r) = &self.view;
        Ok(idx.query_filtered(self.store.rows(), key, view, filters))
    }

    pub fn lookup_unique(&self, index: &str, key: &[&[u8]]) -> Result<Option<RowId>> {
        let Some(idx) = self.store.index(index) else {
            bail!("table '{}' has no index named '{}'", self.table.name(), index);
        };
        Ok(idx.query_unique(self.store.rows(), key, &self.view))
    }
}

/// Iterator over the visible rows of a [`TableReader`].
pub struct Scan<'r> {
    store: &'r TableStore,
    view: &'r dyn Visibility,
    next: RowId,
    max: RowId,
}

impl<'r> Iterator for Scan<'r> {
    type Item = (RowId, &'r [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next <= self.max {
            let id = self.next;
            self.next += 1;
            if self.view.is_visible(self.store.rows(), id) {
                return Some((id, self.store.row(id)));
            }
        }
        None
    }
}
