//! # Tables
//!
//! A table is one row arena, the hash indexes over it and an optional
//! var-data store, guarded by two locks:
//!
//! - the transaction-level [`TableLock`], held by a connection from its first
//!   write (or explicit `rdlock_table`) until commit or rollback
//! - the storage `RwLock` around [`TableStore`], held for the duration of a
//!   single operation
//!
//! ## Row Layout
//!
//! ```text
//! +--------------------+---------+-----+-------------------+-----+
//! | user row (row_size)| pad to 4| ctl | pad | var desc (8)| pad |
//! +--------------------+---------+-----+-------------------+-----+
//! ```
//!
//! The user area is at least 4 bytes so the free-list link fits. The control
//! byte follows it, the var-data descriptor (if any) sits at the next 4-byte
//! boundary and the slot is rounded up to a multiple of 4.
//!
//! Files for table `N` are `T{N:06}.dat`, `T{N:06}.lck` and
//! `T{N:06}.V{class:02}`.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Weak};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use super::Database;
use crate::config::{normalize_capacity, DatabaseOptions, LockMode, TableOptions, VAR_DESCRIPTOR_SIZE};
use crate::error::CoreError;
use crate::index::{HashIndex, KeySpec};
use crate::storage::file_lock::{LockFile, RangeLockGuard, RangeLockKind, STORAGE_LOCK_BYTE};
use crate::storage::{Arena, ArenaConfig, ArenaKind, Backing, RowId, RowState, VarRef, VarStore};
use crate::txn::lock::{LockLevel, TableLock};
use crate::txn::{CommittedView, RowBitmap, Visibility};

pub type TableId = u32;
pub type DbId = u32;

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub key: KeySpec,
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, key: KeySpec) -> Self {
        Self {
            name: name.into(),
            key,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Declaration of a table: fixed row size, optional var data, indexes.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub id: Option<TableId>,
    pub row_size: usize,
    pub var_data: bool,
    pub indexes: Vec<IndexDef>,
    pub options: TableOptions,
}

impl TableDef {
    pub fn new(name: impl Into<String>, row_size: usize) -> Self {
        Self {
            name: name.into(),
            id: None,
            row_size,
            var_data: false,
            indexes: Vec::new(),
            options: TableOptions::default(),
        }
    }

    pub fn with_id(mut self, id: TableId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_var_data(mut self) -> Self {
        self.var_data = true;
        self
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.options.in_memory = true;
        self
    }

    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.options.lock_mode = Some(mode);
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.options.initial_capacity = Some(capacity);
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.name.is_empty(), "table name must not be empty");
        ensure!(self.row_size > 0, "table '{}' has a zero row size", self.name);
        let mut names = HashSet::new();
        for index in &self.indexes {
            ensure!(
                names.insert(index.name.as_str()),
                "table '{}' declares index '{}' twice",
                self.name,
                index.name
            );
            ensure!(
                index.key.min_row_size() <= self.row_size,
                "index '{}' reaches byte {} of a {}-byte row",
                index.name,
                index.key.min_row_size(),
                self.row_size
            );
        }
        Ok(())
    }
}

const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLayout {
    pub row_size: usize,
    pub control_offset: usize,
    pub var_offset: Option<usize>,
    pub slot_size: usize,
}

impl RowLayout {
    pub fn new(row_size: usize, var_data: bool) -> Self {
        let control_offset = align4(row_size.max(4));
        let var_offset = var_data.then(|| align4(control_offset + 1));
        let end = match var_offset {
            Some(off) => off + VAR_DESCRIPTOR_SIZE,
            None => control_offset + 1,
        };
        Self {
            row_size,
            control_offset,
            var_offset,
            slot_size: align4(end),
        }
    }
}

/// Outcome of [`TableStore::repair`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub live: u32,
    pub reclaimed: u32,
}

/// The storage of one table. Always accessed through the table's storage
/// lock.
#[derive(Debug)]
pub struct TableStore {
    layout: RowLayout,
    rows: Arena,
    indexes: Vec<HashIndex>,
    vars: Option<VarStore>,
}

impl TableStore {
    pub fn rows(&self) -> &Arena {
        &self.rows
    }

    pub fn layout(&self) -> RowLayout {
        self.layout
    }

    pub fn indexes(&self) -> &[HashIndex] {
        &self.indexes
    }

    pub fn index(&self, name: &str) -> Option<&HashIndex> {
        self.indexes.iter().find(|i| i.name() == name)
    }

    /// State of `id`, or `None` if it was never allocated.
    pub fn state(&self, id: RowId) -> Option<RowState> {
        (id >= 1 && id <= self.rows.max_id()).then(|| self.rows.row_state(id))
    }

    /// The user bytes of row `id`.
    pub fn row(&self, id: RowId) -> &[u8] {
        &self.rows.slot(id)[..self.layout.row_size]
    }

    pub fn var_ref(&self, id: RowId) -> Option<VarRef> {
        let offset = self.layout.var_offset?;
        VarRef::read(self.rows.slot(id), offset)
    }

    pub fn var_data(&self, id: RowId) -> Option<&[u8]> {
        let var = self.var_ref(id)?;
        self.vars.as_ref()?.get(var)
    }

    /// Rows in Committed or InTransaction state.
    pub fn live_rows(&self) -> u32 {
        self.rows.allocated()
    }

    /// Stores a new row, links it into every index and then sets `state`.
    ///
    /// The row stays Dirty while indexing, so no uniqueness check can see it.
    /// On any failure nothing of the row is left behind.
    pub fn insert(
        &mut self,
        row: &[u8],
        var: Option<&[u8]>,
        state: RowState,
        view: &dyn Visibility,
    ) -> Result<RowId> {
        ensure!(
            row.len() == self.layout.row_size,
            "row is {} bytes, table rows are {}",
            row.len(),
            self.layout.row_size
        );

        let var_ref = match (var, self.vars.as_mut()) {
            (Some(data), Some(vars)) => Some(vars.store(data)?),
            (Some(_), None) => bail!("table has no variable-length data"),
            (None, _) => None,
        };

        let id = match self.rows.allocate() {
            Ok(id) => id,
            Err(e) => {
                self.release_var(var_ref);
                return Err(e);
            }
        };

        let layout = self.layout;
        let slot = self.rows.slot_mut(id);
        slot.fill(0);
        slot[..row.len()].copy_from_slice(row);
        if let Some(offset) = layout.var_offset {
            VarRef::write(var_ref, slot, offset);
        }
        self.rows.set_row_state(id, RowState::Dirty);

        for i in 0..self.indexes.len() {
            if let Err(e) = self.indexes[i].add(id, &self.rows, Some(view)) {
                for index in &mut self.indexes[..i] {
                    index.remove(id);
                }
                self.release_var(var_ref);
                self.rows.free(id);
                return Err(e);
            }
        }

        self.rows.set_row_state(id, state);
        Ok(id)
    }

    fn release_var(&mut self, var: Option<VarRef>) {
        if let (Some(var), Some(vars)) = (var, self.vars.as_mut()) {
            vars.release(var);
        }
    }

    /// Unindexes `id`, releases its var data and frees the slot.
    pub fn remove(&mut self, id: RowId) {
        for index in &mut self.indexes {
            index.remove(id);
        }
        let var = self.var_ref(id);
        self.release_var(var);
        self.rows.free(id);
    }

    pub fn set_state(&mut self, id: RowId, state: RowState) {
        self.rows.set_row_state(id, state);
    }

    /// The first unique index already holding a visible row, other than
    /// `exclude`, with the key stored in `row`.
    pub fn find_conflict(&self, row: &[u8], view: &dyn Visibility, exclude: RowId) -> Option<(&str, RowId)> {
        self.indexes
            .iter()
            .filter(|i| i.is_unique())
            .find_map(|i| {
                i.find_conflict(&self.rows, row, view, exclude)
                    .map(|existing| (i.name(), existing))
            })
    }

    pub(crate) fn apply_commit(&mut self, inserted: &RowBitmap, deleted: &RowBitmap) {
        for id in inserted.iter() {
            if self.state(id) == Some(RowState::InTransaction) {
                self.rows.set_row_state(id, RowState::Committed);
            }
        }
        for id in deleted.iter() {
            if self.state(id) == Some(RowState::Committed) {
                self.remove(id);
            }
        }
    }

    pub(crate) fn apply_rollback(&mut self, inserted: &RowBitmap) {
        for id in inserted.iter() {
            if self.state(id) == Some(RowState::InTransaction) {
                self.remove(id);
            }
        }
    }

    /// The full slot of `id` followed by its var data, as logged.
    pub(crate) fn wal_payload(&self, id: RowId) -> (&[u8], &[u8]) {
        (self.rows.slot(id), self.var_data(id).unwrap_or(&[]))
    }

    pub(crate) fn redo_insert(&mut self, id: RowId, payload: &[u8]) -> Result<()> {
        let slot_size = self.layout.slot_size;
        if payload.len() < slot_size {
            bail!(CoreError::Corruption {
                what: format!(
                    "logged row {} carries {} bytes, slot is {}",
                    id,
                    payload.len(),
                    slot_size
                ),
            });
        }
        self.rows.claim(id)?;
        self.rows.slot_mut(id).copy_from_slice(&payload[..slot_size]);

        let extra = &payload[slot_size..];
        match (self.var_ref(id), self.vars.as_mut()) {
            (Some(var), Some(vars)) => vars.place(var, extra)?,
            (Some(_), None) => bail!("logged row {} references var data the table lacks", id),
            (None, _) => {}
        }
        self.rows.set_row_state(id, RowState::Committed);
        Ok(())
    }

    pub(crate) fn redo_delete(&mut self, id: RowId) {
        if self.state(id).is_some_and(RowState::is_live) {
            self.rows.set_row_state(id, RowState::Free);
        }
    }

    /// Frees every row not Committed, rebuilds the free list and drops var
    /// data no committed row references.
    pub fn repair(&mut self) -> RepairStats {
        let mut reclaimed = 0;
        for id in 1..=self.rows.max_id() {
            if matches!(self.rows.row_state(id), RowState::Dirty | RowState::InTransaction) {
                self.rows.set_row_state(id, RowState::Free);
                reclaimed += 1;
            }
        }

        let control = self.layout.control_offset;
        let live = self
            .rows
            .rebuild_free_list(|_, slot| RowState::from_control(slot[control]) == RowState::Committed);

        if self.vars.is_some() {
            let referenced: HashSet<VarRef> = (1..=self.rows.max_id())
                .filter(|&id| self.rows.row_state(id) == RowState::Committed)
                .filter_map(|id| self.var_ref(id))
                .collect();
            if let Some(vars) = self.vars.as_mut() {
                vars.rebuild(&referenced);
            }
        }

        RepairStats { live, reclaimed }
    }

    /// Rebuilds every index from the committed rows.
    pub fn rebuild_indexes(&mut self) -> Result<()> {
        let capacity = self.rows.capacity();
        for index in &mut self.indexes {
            let mut fresh =
                HashIndex::new(index.name(), index.key_spec().clone(), index.is_unique(), capacity)?;
            for id in self.rows.live_ids() {
                if fresh.is_unique() {
                    let key = fresh.key_spec().extract(self.rows.slot(id));
                    if let Some(existing) = fresh.query_unique(&self.rows, &key, &CommittedView) {
                        warn!(
                            index = fresh.name(),
                            row = id,
                            existing,
                            "committed rows share a unique key"
                        );
                    }
                }
                fresh.add(id, &self.rows, None)?;
            }
            *index = fresh;
        }
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        self.rows.sync_all()?;
        if let Some(vars) = &self.vars {
            vars.sync_all()?;
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        self.rows.refresh()?;
        if let Some(vars) = self.vars.as_mut() {
            vars.refresh()?;
        }
        Ok(())
    }
}

/// In-process holders of the storage byte. The byte is locked while any
/// holder is alive, so one holder's release never strips another's lock.
#[derive(Debug, Default)]
struct StorageByte {
    holders: u32,
    guard: Option<RangeLockGuard>,
}

struct StorageByteHold<'a> {
    byte: &'a Mutex<StorageByte>,
}

impl Drop for StorageByteHold<'_> {
    fn drop(&mut self) {
        let mut byte = self.byte.lock();
        byte.holders -= 1;
        if byte.holders == 0 {
            byte.guard = None;
        }
    }
}

// Fields drop in order: the storage byte goes before the in-process lock.

/// Shared hold on a table's storage for one operation.
pub struct StoreReadGuard<'a> {
    _file: Option<StorageByteHold<'a>>,
    store: RwLockReadGuard<'a, TableStore>,
}

impl Deref for StoreReadGuard<'_> {
    type Target = TableStore;

    fn deref(&self) -> &TableStore {
        &self.store
    }
}

/// Exclusive hold on a table's storage for one operation.
pub struct StoreWriteGuard<'a> {
    _file: Option<StorageByteHold<'a>>,
    store: RwLockWriteGuard<'a, TableStore>,
}

impl Deref for StoreWriteGuard<'_> {
    type Target = TableStore;

    fn deref(&self) -> &TableStore {
        &self.store
    }
}

impl DerefMut for StoreWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut TableStore {
        &mut self.store
    }
}

pub struct Table {
    id: TableId,
    db_id: DbId,
    name: String,
    layout: RowLayout,
    in_memory: bool,
    db: Weak<Database>,
    txn_lock: TableLock,
    lock_file: Option<LockFile>,
    storage_byte: Mutex<StorageByte>,
    store: RwLock<TableStore>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("db_id", &self.db_id)
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("in_memory", &self.in_memory)
            .field("lock_mode", &self.txn_lock.mode())
            .finish()
    }
}

impl Table {
    /// Opens the table's files (or heap arenas) without repairing them.
    /// Recovery replays the WAL first and then calls [`Table::finish_open`].
    pub(crate) fn open(
        db: Weak<Database>,
        db_id: DbId,
        dir: Option<&Path>,
        id: TableId,
        def: &TableDef,
        db_options: &DatabaseOptions,
    ) -> Result<Self> {
        def.validate()?;

        let layout = RowLayout::new(def.row_size, def.var_data);
        let dir = if def.options.in_memory { None } else { dir };
        let prefix = format!("T{:06}", id);
        let capacity = def
            .options
            .initial_capacity
            .map(normalize_capacity)
            .unwrap_or_else(|| db_options.arena_capacity());

        let config = ArenaConfig::new(ArenaKind::Rows, layout.slot_size as u32, capacity)
            .with_control_offset(layout.control_offset as u32);
        let data_path = dir.map(|d| d.join(format!("{}.dat", prefix)));
        let backing = match &data_path {
            Some(p) => Backing::File(p),
            None => Backing::Memory,
        };
        let rows = Arena::open(backing, &config)
            .wrap_err_with(|| format!("failed to open rows of table '{}'", def.name))?;

        let mut lock_mode = def.options.lock_mode.unwrap_or(db_options.lock_mode);
        if lock_mode == LockMode::Process && dir.is_none() {
            debug!(table = %def.name, "in-memory table cannot be process shared, using thread locks");
            lock_mode = LockMode::Thread;
        }
        let lock_file = match (lock_mode, dir) {
            (LockMode::Process, Some(d)) => Some(LockFile::open(d.join(format!("{}.lck", prefix)))?),
            _ => None,
        };

        let vars = if def.var_data {
            Some(VarStore::open(dir, &prefix)?)
        } else {
            None
        };

        let indexes = def
            .indexes
            .iter()
            .map(|i| HashIndex::new(&i.name, i.key.clone(), i.unique, rows.capacity()))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            table = %def.name,
            id,
            slot_size = layout.slot_size,
            persistent = rows.is_persistent(),
            "table opened"
        );

        Ok(Self {
            id,
            db_id,
            name: def.name.clone(),
            layout,
            in_memory: !rows.is_persistent(),
            db,
            txn_lock: TableLock::new(lock_mode),
            lock_file,
            storage_byte: Mutex::new(StorageByte::default()),
            store: RwLock::new(TableStore {
                layout,
                rows,
                indexes,
                vars,
            }),
        })
    }

    /// Repairs the storage and builds the indexes.
    pub(crate) fn finish_open(&self) -> Result<RepairStats> {
        let mut store = self.write_store()?;
        let stats = store.repair();
        store.rebuild_indexes()?;
        if stats.reclaimed > 0 {
            debug!(table = %self.name, reclaimed = stats.reclaimed, "uncommitted rows reclaimed");
        }
        Ok(stats)
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> RowLayout {
        self.layout
    }

    pub fn row_size(&self) -> usize {
        self.layout.row_size
    }

    pub fn has_var_data(&self) -> bool {
        self.layout.var_offset.is_some()
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    pub fn lock_mode(&self) -> LockMode {
        self.txn_lock.mode()
    }

    pub fn database(&self) -> Option<Arc<Database>> {
        self.db.upgrade()
    }

    pub(crate) fn lock_txn(&self, level: LockLevel) -> Result<()> {
        self.txn_lock.acquire(level, self.lock_file.as_ref())
    }

    pub(crate) fn unlock_txn(&self, level: LockLevel) {
        self.txn_lock.release(level)
    }

    fn hold_storage_byte(&self, kind: RangeLockKind) -> Result<Option<StorageByteHold<'_>>> {
        let Some(file) = &self.lock_file else {
            return Ok(None);
        };
        let mut byte = self.storage_byte.lock();
        if byte.guard.is_none() {
            byte.guard = Some(file.lock(STORAGE_LOCK_BYTE, kind)?);
        } else if kind == RangeLockKind::Exclusive {
            if let Some(guard) = byte.guard.as_mut() {
                guard.convert(kind)?;
            }
        }
        byte.holders += 1;
        Ok(Some(StorageByteHold {
            byte: &self.storage_byte,
        }))
    }

    #[cfg(test)]
    fn storage_byte_state(&self) -> (u32, Option<RangeLockKind>) {
        let byte = self.storage_byte.lock();
        (byte.holders, byte.guard.as_ref().map(|g| g.kind()))
    }

    pub fn read_store(&self) -> Result<StoreReadGuard<'_>> {
        if self.lock_file.is_none() {
            return Ok(StoreReadGuard {
                _file: None,
                store: self.store.read(),
            });
        }
        // Another process may have grown the files; remapping needs `&mut`.
        let mut store = self.store.write();
        let file = self.hold_storage_byte(RangeLockKind::Shared)?;
        store.refresh()?;
        Ok(StoreReadGuard {
            _file: file,
            store: RwLockWriteGuard::downgrade(store),
        })
    }

    pub fn write_store(&self) -> Result<StoreWriteGuard<'_>> {
        let mut store = self.store.write();
        let file = self.hold_storage_byte(RangeLockKind::Exclusive)?;
        if file.is_some() {
            store.refresh()?;
        }
        Ok(StoreWriteGuard { _file: file, store })
    }
}
