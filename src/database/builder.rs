//! # Database Builder
//!
//! Configures and opens a database registered with an [`Engine`]. Tables that
//! already have files on disk must be declared here so recovery can replay
//! the WAL into them before the database is handed out.
//!
//! ## Configuration Options
//!
//! | Option               | Default  | Description                                |
//! |----------------------|----------|--------------------------------------------|
//! | path                 | none     | Directory for table files and the WAL      |
//! | lock_mode            | thread   | Default lock mode of every table           |
//! | sync_mode            | commit   | When WAL appends reach stable storage      |
//! | initial_capacity     | 8        | Starting slot count of new arenas          |
//! | wal_switch_threshold | 256 MiB  | Active segment size that forces a checkpoint |
//!
//! Without a path the database and every table in it live on the heap.
//!
//! ## Usage
//!
//! ```ignore
//! let db = engine
//!     .database("app")
//!     .path("./app-data")
//!     .sync_mode(SyncMode::EveryN(32))
//!     .table(TableDef::new("users", 16))
//!     .open()?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use tracing::debug;

use super::{Database, TableDef};
use crate::config::{DatabaseOptions, LockMode, SyncMode};
use crate::engine::Engine;

pub struct DatabaseBuilder<'e> {
    engine: &'e Engine,
    name: String,
    path: Option<PathBuf>,
    options: DatabaseOptions,
    tables: Vec<TableDef>,
}

impl<'e> DatabaseBuilder<'e> {
    pub(crate) fn new(engine: &'e Engine, name: &str) -> Self {
        Self {
            engine,
            name: name.to_string(),
            path: None,
            options: DatabaseOptions::default(),
            tables: Vec::new(),
        }
    }

    /// Stores the database in `path`, creating the directory if needed.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.options.lock_mode = mode;
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.options.sync_mode = mode;
        self
    }

    pub fn initial_capacity(mut self, slots: u32) -> Self {
        self.options.initial_capacity = slots;
        self
    }

    pub fn wal_switch_threshold(mut self, bytes: u64) -> Self {
        self.options.wal_switch_threshold = bytes;
        self
    }

    pub fn options(mut self, options: DatabaseOptions) -> Self {
        self.options = options;
        self
    }

    /// Declares a table. Ids are assigned in declaration order unless the
    /// definition carries one.
    pub fn table(mut self, def: TableDef) -> Self {
        self.tables.push(def);
        self
    }

    /// Opens every declared table, recovers from the WAL and registers the
    /// database with the engine.
    pub fn open(self) -> Result<Arc<Database>> {
        ensure!(!self.name.is_empty(), "database name cannot be empty");
        ensure!(
            self.engine.get_database(&self.name).is_none(),
            "database '{}' is already open",
            self.name
        );
        for def in &self.tables {
            def.validate()?;
        }

        if let Some(dir) = &self.path {
            std::fs::create_dir_all(dir)
                .wrap_err_with(|| format!("failed to create database directory '{}'", dir.display()))?;
        }

        let db = Database::new(self.engine.next_db_id(), &self.name, self.path, self.options)?;
        for def in &self.tables {
            db.attach_table(def)
                .wrap_err_with(|| format!("failed to open table '{}'", def.name))?;
        }
        db.recover()?;

        self.engine.register(Arc::clone(&db))?;
        debug!(db = %db.name(), id = db.id(), tables = self.tables.len(), "database opened");
        Ok(db)
    }
}
