//! # Engine
//!
//! The [`Engine`] owns everything that would otherwise be process-global:
//! the registry of open databases, the id counters for databases and
//! connections, the system connection used for housekeeping, and the optional
//! background flusher.
//!
//! ## Background Flusher
//!
//! With `EngineOptions::flush_interval` set, a thread wakes once per interval
//! and checkpoints every database that committed since its last checkpoint.
//! It stops when the engine is closed or dropped.
//!
//! ```text
//! Engine::open ──spawn──> flusher ──every interval──> Database::checkpoint
//!      │                     ▲
//!      └── close / drop ─────┘ stop flag + Condvar::notify_one, then join
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineOptions;
use crate::database::{Database, DatabaseBuilder, DbId};
use crate::txn::{Connection, ConnectionId};

struct Shared {
    databases: RwLock<HashMap<String, Arc<Database>>>,
    stop: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn snapshot(&self) -> Vec<Arc<Database>> {
        self.databases.read().values().cloned().collect()
    }

    fn flush_changed(&self) {
        for db in self.snapshot() {
            if !db.needs_flush() {
                continue;
            }
            if let Err(e) = db.checkpoint() {
                warn!(db = %db.name(), error = %e, "background checkpoint failed");
            }
        }
    }
}

pub struct Engine {
    shared: Arc<Shared>,
    options: EngineOptions,
    next_db_id: AtomicU32,
    next_conn_id: AtomicU64,
    system: Mutex<Connection>,
    flusher: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("databases", &self.shared.databases.read().len())
            .field("flusher", &self.flusher.is_some())
            .finish()
    }
}

impl Default for Engine {
    /// An engine without a background flusher.
    fn default() -> Self {
        Self::idle(EngineOptions::default())
    }
}

impl Engine {
    fn idle(options: EngineOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                databases: RwLock::new(HashMap::new()),
                stop: Mutex::new(false),
                wake: Condvar::new(),
            }),
            options,
            next_db_id: AtomicU32::new(1),
            next_conn_id: AtomicU64::new(1),
            system: Mutex::new(Connection::new(0)),
            flusher: None,
        }
    }

    pub fn open(options: EngineOptions) -> Result<Self> {
        let mut engine = Self::idle(options);
        if let Some(interval) = engine.options.flush_interval {
            ensure!(!interval.is_zero(), "flush interval must be non-zero");
            let shared = Arc::clone(&engine.shared);
            let handle = std::thread::Builder::new()
                .name("slabdb-flusher".into())
                .spawn(move || run_flusher(shared, interval))
                .wrap_err("failed to start the background flusher")?;
            engine.flusher = Some(handle);
            debug!(?interval, "background flusher started");
        }
        Ok(engine)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Starts configuring a database called `name`.
    pub fn database(&self, name: &str) -> DatabaseBuilder<'_> {
        DatabaseBuilder::new(self, name)
    }

    pub fn get_database(&self, name: &str) -> Option<Arc<Database>> {
        self.shared.databases.read().get(name).cloned()
    }

    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.shared.snapshot()
    }

    pub(crate) fn next_db_id(&self) -> DbId {
        self.next_db_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, db: Arc<Database>) -> Result<()> {
        let mut databases = self.shared.databases.write();
        ensure!(
            !databases.contains_key(db.name()),
            "database '{}' is already open",
            db.name()
        );
        databases.insert(db.name().to_string(), db);
        Ok(())
    }

    pub fn connect(&self) -> Connection {
        let id: ConnectionId = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        Connection::new(id)
    }

    /// The engine-owned connection used for housekeeping writes.
    pub fn system_connection(&self) -> MutexGuard<'_, Connection> {
        self.system.lock()
    }

    /// Checkpoints and unregisters `name`. Returns false if no such database
    /// is open.
    pub fn close_database(&self, name: &str) -> Result<bool> {
        let Some(db) = self.get_database(name) else {
            return Ok(false);
        };
        db.close()?;
        self.shared.databases.write().remove(name);
        info!(db = %name, "database unregistered");
        Ok(true)
    }

    pub fn checkpoint_all(&self) -> Result<()> {
        for db in self.shared.snapshot() {
            db.checkpoint()
                .wrap_err_with(|| format!("checkpoint of database '{}' failed", db.name()))?;
        }
        Ok(())
    }

    fn stop_flusher(&mut self) {
        let Some(handle) = self.flusher.take() else {
            return;
        };
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_one();
        if handle.join().is_err() {
            warn!("background flusher panicked");
        }
    }

    /// Stops the flusher, rolls back the system connection and closes every
    /// database.
    pub fn close(mut self) -> Result<()> {
        self.stop_flusher();
        self.system.lock().rollback()?;
        let databases: Vec<Arc<Database>> = self.shared.databases.write().drain().map(|(_, db)| db).collect();
        for db in databases {
            db.close()?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

fn run_flusher(shared: Arc<Shared>, interval: Duration) {
    let mut stop = shared.stop.lock();
    while !*stop {
        shared.wake.wait_for(&mut stop, interval);
        if *stop {
            break;
        }
        MutexGuard::unlocked(&mut stop, || shared.flush_changed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{IndexDef, TableDef};
    use crate::index::{KeyField, KeySpec};
    use std::time::Instant;

    fn items() -> TableDef {
        TableDef::new("items", 8)
            .with_index(IndexDef::new("pk", KeySpec::new([KeyField::binary(0, 4)]).unwrap()).unique())
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let engine = Engine::default();
        engine.database("a").table(items()).open().unwrap();
        assert!(engine.database("a").open().is_err());
        assert!(engine.get_database("a").is_some());
        assert_eq!(engine.databases().len(), 1);
    }

    #[test]
    fn database_ids_are_distinct() {
        let engine = Engine::default();
        let a = engine.database("a").open().unwrap();
        let b = engine.database("b").open().unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn connection_ids_are_distinct() {
        let engine = Engine::default();
        let a = engine.connect();
        let b = engine.connect();
        assert_ne!(a.id(), b.id());
        assert_eq!(engine.system_connection().id(), 0);
    }

    #[test]
    fn close_database_checkpoints_and_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::default();
        let db = engine.database("disk").path(dir.path()).table(items()).open().unwrap();
        let table = db.table("items").unwrap();
        engine.connect().insert(&table, &[1, 0, 0, 0, 0, 0, 0, 0], None).unwrap();
        assert!(db.needs_flush());

        assert!(engine.close_database("disk").unwrap());
        assert!(!db.needs_flush());
        assert!(engine.get_database("disk").is_none());
        assert!(!engine.close_database("disk").unwrap());
        drop(table);
        drop(db);

        // The name is free again and the row survived.
        let db = engine.database("disk").path(dir.path()).table(items()).open().unwrap();
        let conn = engine.connect();
        let table = db.table("items").unwrap();
        assert_eq!(conn.read(&table).unwrap().row_count(), 1);
    }

    #[test]
    fn system_connection_writes() {
        let engine = Engine::default();
        let db = engine.database("sys").table(items()).open().unwrap();
        let table = db.table("items").unwrap();
        let id = engine
            .system_connection()
            .insert(&table, &[5, 0, 0, 0, 0, 0, 0, 0], None)
            .unwrap();
        let conn = engine.connect();
        assert!(conn.is_visible(&table, id).unwrap());
    }

    #[test]
    fn background_flusher_checkpoints_changed_databases() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(EngineOptions {
            flush_interval: Some(Duration::from_millis(10)),
        })
        .unwrap();
        let db = engine.database("bg").path(dir.path()).table(items()).open().unwrap();
        let table = db.table("items").unwrap();
        engine.connect().insert(&table, &[1, 0, 0, 0, 0, 0, 0, 0], None).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while db.needs_flush() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!db.needs_flush());
        assert_eq!(db.wal_stats().unwrap().active_bytes, 0);
        engine.close().unwrap();
    }

    #[test]
    fn zero_flush_interval_is_rejected() {
        assert!(Engine::open(EngineOptions {
            flush_interval: Some(Duration::ZERO),
        })
        .is_err());
    }
}
