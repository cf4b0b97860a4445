//! # Databases
//!
//! A [`Database`] is a named set of tables sharing one directory and one WAL.
//! A database opened without a directory keeps everything on the heap and
//! has no WAL.
//!
//! ## Directory Layout
//!
//! ```text
//! <dir>/
//! ├── wal0.log, wal1.log      two WAL segments
//! ├── T000001.dat             rows of table 1
//! ├── T000001.lck             process locks of table 1
//! └── T000001.V07             var data of table 1, class 7
//! ```
//!
//! ## Lock Order
//!
//! WAL mutex, then table storage locks. Commit holds the WAL mutex across
//! logging and applying so a checkpoint can never reset a segment whose
//! commits are not yet reflected in the tables it syncs.

mod builder;
mod recovery;
mod table;

pub use builder::DatabaseBuilder;
pub use recovery::RecoveryReport;
pub use table::{
    DbId, IndexDef, RepairStats, RowLayout, StoreReadGuard, StoreWriteGuard, Table, TableDef,
    TableId, TableStore,
};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, info_span, warn};

use crate::config::DatabaseOptions;
use crate::txn::RowBitmap;
use crate::wal::{SwitchOutcome, TableChanges, Wal, WalStats};

/// One table's share of a transaction being committed or rolled back.
pub(crate) struct PendingChanges<'a> {
    pub table: &'a Arc<Table>,
    pub inserted: &'a RowBitmap,
    pub deleted: &'a RowBitmap,
}

impl PendingChanges<'_> {
    pub(crate) fn apply_commit(&self) -> Result<()> {
        self.table.write_store()?.apply_commit(self.inserted, self.deleted);
        Ok(())
    }

    pub(crate) fn apply_rollback(&self) -> Result<()> {
        self.table.write_store()?.apply_rollback(self.inserted);
        Ok(())
    }
}

pub struct Database {
    id: DbId,
    name: String,
    dir: Option<PathBuf>,
    options: DatabaseOptions,
    tables: RwLock<Vec<Arc<Table>>>,
    wal: Option<Mutex<Wal>>,
    /// Bumped by every commit that changed a table.
    change_id: AtomicU64,
    /// `change_id` as of the last checkpoint.
    flushed_id: AtomicU64,
    recovery: Mutex<RecoveryReport>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("tables", &self.tables.read().len())
            .finish()
    }
}

impl Database {
    pub(crate) fn new(id: DbId, name: &str, dir: Option<PathBuf>, options: DatabaseOptions) -> Result<Arc<Self>> {
        let wal = match &dir {
            Some(d) => Some(Mutex::new(Wal::open(
                d,
                options.sync_mode,
                options.wal_switch_threshold,
            )?)),
            None => None,
        };
        Ok(Arc::new(Self {
            id,
            name: name.to_string(),
            dir,
            options,
            tables: RwLock::new(Vec::new()),
            wal,
            change_id: AtomicU64::new(0),
            flushed_id: AtomicU64::new(0),
            recovery: Mutex::new(RecoveryReport::default()),
        }))
    }

    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().iter().find(|t| t.name() == name).cloned()
    }

    pub fn table_by_id(&self, id: TableId) -> Option<Arc<Table>> {
        self.tables.read().iter().find(|t| t.id() == id).cloned()
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().clone()
    }

    /// What the last open recovered.
    pub fn recovery_report(&self) -> RecoveryReport {
        *self.recovery.lock()
    }

    /// Registers a table without repairing it or building its indexes.
    pub(crate) fn attach_table(self: &Arc<Self>, def: &TableDef) -> Result<Arc<Table>> {
        let mut tables = self.tables.write();
        ensure!(
            tables.iter().all(|t| t.name() != def.name),
            "table '{}' already exists in database '{}'",
            def.name,
            self.name
        );
        let id = match def.id {
            Some(id) => {
                ensure!(id != 0, "table id 0 is reserved");
                ensure!(
                    tables.iter().all(|t| t.id() != id),
                    "table id {} already taken in database '{}'",
                    id,
                    self.name
                );
                id
            }
            None => tables.iter().map(|t| t.id()).max().unwrap_or(0) + 1,
        };

        let table = Arc::new(Table::open(
            Arc::downgrade(self),
            self.id,
            self.dir.as_deref(),
            id,
            def,
            &self.options,
        )?);
        tables.push(Arc::clone(&table));
        Ok(table)
    }

    /// Adds a table to an open database. Existing files are repaired but have
    /// no WAL replayed; declare such tables on the builder instead.
    pub fn create_table(self: &Arc<Self>, def: TableDef) -> Result<Arc<Table>> {
        let table = self.attach_table(&def)?;
        if let Err(e) = table.finish_open() {
            self.tables.write().retain(|t| !Arc::ptr_eq(t, &table));
            return Err(e);
        }
        debug!(db = %self.name, table = %def.name, id = table.id(), "table created");
        Ok(table)
    }

    /// Logs one transaction's changes and applies them. Returns the commit id
    /// if a WAL record was written.
    pub(crate) fn commit(&self, changes: &[PendingChanges<'_>]) -> Result<Option<u64>> {
        let mut wal = self.wal.as_ref().map(|w| w.lock());
        let mut commit_id = None;

        if let Some(wal) = wal.as_mut() {
            let logged: Vec<&PendingChanges<'_>> =
                changes.iter().filter(|c| !c.table.is_in_memory()).collect();
            if !logged.is_empty() {
                let guards = logged
                    .iter()
                    .map(|c| c.table.read_store())
                    .collect::<Result<Vec<_>>>()?;
                let entries: Vec<TableChanges<'_>> = logged
                    .iter()
                    .zip(&guards)
                    .map(|(c, g)| TableChanges {
                        table_id: c.table.id(),
                        store: &**g,
                        inserted: c.inserted,
                        deleted: c.deleted,
                    })
                    .collect();
                match wal.append(&entries) {
                    Ok(id) => commit_id = id,
                    Err(e) => warn!(db = %self.name, error = %e, "WAL append failed, commit is not durable"),
                }
            }
        }

        for c in changes {
            c.apply_commit()?;
        }
        self.change_id.fetch_add(1, Ordering::AcqRel);

        let due = wal.as_ref().is_some_and(|w| w.needs_checkpoint());
        drop(wal);
        if due {
            if let Err(e) = self.checkpoint() {
                warn!(db = %self.name, error = %e, "automatic checkpoint failed");
            }
        }
        Ok(commit_id)
    }

    pub(crate) fn rollback(&self, changes: &[PendingChanges<'_>]) -> Result<()> {
        for c in changes {
            c.apply_rollback()?;
        }
        if let Some(wal) = &self.wal {
            wal.lock().note_rollback();
        }
        Ok(())
    }

    fn sync_tables(&self) -> Result<()> {
        for table in self.tables.read().iter().filter(|t| !t.is_in_memory()) {
            table.read_store()?.sync_all()?;
        }
        Ok(())
    }

    /// Switches the WAL, syncs every table and drops the drained segment.
    pub fn checkpoint(&self) -> Result<SwitchOutcome> {
        let _span = info_span!("checkpoint", db = %self.name).entered();
        let Some(wal) = &self.wal else {
            self.flushed_id.store(self.change_id.load(Ordering::Acquire), Ordering::Release);
            return Ok(SwitchOutcome::Empty);
        };

        let mut wal = wal.lock();
        let changes = self.change_id.load(Ordering::Acquire);
        let mut outcome = wal.switch()?;
        if outcome == SwitchOutcome::Busy {
            debug!("draining backup segment left by an earlier checkpoint");
            self.sync_tables()?;
            wal.reset_backup()?;
            outcome = wal.switch()?;
        }
        if outcome == SwitchOutcome::Switched {
            self.sync_tables()?;
            wal.reset_backup()?;
            info!(commit_id = wal.commit_id(), "checkpoint complete");
        }
        self.flushed_id.store(changes, Ordering::Release);
        Ok(outcome)
    }

    /// True if a commit happened since the last checkpoint.
    pub fn needs_flush(&self) -> bool {
        self.change_id.load(Ordering::Acquire) != self.flushed_id.load(Ordering::Acquire)
    }

    pub fn wal_stats(&self) -> Option<WalStats> {
        self.wal.as_ref().map(|w| w.lock().stats())
    }

    /// Checkpoints. The database stays usable; the engine calls this before
    /// unregistering it.
    pub fn close(&self) -> Result<()> {
        self.checkpoint()?;
        debug!(db = %self.name, "database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::index::{KeyField, KeySpec};

    fn users() -> TableDef {
        TableDef::new("users", 8)
            .with_index(IndexDef::new("pk", KeySpec::new([KeyField::binary(0, 4)]).unwrap()).unique())
    }

    #[test]
    fn table_ids_follow_declaration_order() {
        let engine = Engine::default();
        let db = engine
            .database("ids")
            .table(TableDef::new("a", 4))
            .table(TableDef::new("b", 4).with_id(10))
            .open()
            .unwrap();
        let c = db.create_table(TableDef::new("c", 4)).unwrap();
        assert_eq!(db.table("a").unwrap().id(), 1);
        assert_eq!(db.table_by_id(10).unwrap().name(), "b");
        assert_eq!(c.id(), 11);
        assert!(db.create_table(TableDef::new("a", 4)).is_err());
        assert!(db.create_table(TableDef::new("d", 4).with_id(10)).is_err());
    }

    #[test]
    fn in_memory_database_has_no_wal() {
        let engine = Engine::default();
        let db = engine.database("mem").table(users()).open().unwrap();
        assert!(!db.is_persistent());
        assert!(db.wal_stats().is_none());
        assert!(db.table("users").unwrap().is_in_memory());
        assert_eq!(db.checkpoint().unwrap(), SwitchOutcome::Empty);
    }

    #[test]
    fn commit_logs_and_checkpoint_drains() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::default();
        let db = engine.database("disk").path(dir.path()).table(users()).open().unwrap();
        let users = db.table("users").unwrap();

        let mut conn = engine.connect();
        let id = conn.insert(&users, &[1, 0, 0, 0, 9, 9, 9, 9], None).unwrap();
        assert_eq!(id, 1);
        assert!(db.needs_flush());

        let stats = db.wal_stats().unwrap();
        assert_eq!(stats.commit_id, 1);
        assert!(stats.active_bytes > 0);

        assert_eq!(db.checkpoint().unwrap(), SwitchOutcome::Switched);
        assert!(!db.needs_flush());
        let stats = db.wal_stats().unwrap();
        assert_eq!(stats.active_bytes, 0);
        assert_eq!(stats.backup_bytes, 0);
        assert_eq!(db.checkpoint().unwrap(), SwitchOutcome::Empty);
    }

    #[test]
    fn rollback_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::default();
        let db = engine.database("rb").path(dir.path()).table(users()).open().unwrap();
        let users = db.table("users").unwrap();

        let mut conn = engine.connect();
        conn.begin().unwrap();
        conn.insert(&users, &[2, 0, 0, 0, 0, 0, 0, 0], None).unwrap();
        conn.rollback().unwrap();
        assert_eq!(db.wal_stats().unwrap().rollback_count, 1);
        assert_eq!(db.wal_stats().unwrap().commit_id, 0);
    }
}
