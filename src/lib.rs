//! # slabdb - Row Storage Substrate
//!
//! slabdb is the storage core of an embedded relational engine: fixed-size
//! slot arenas over heap or memory-mapped regions, chained hash indexes with
//! online rehashing, per-connection transactions tracked in sparse bitmaps,
//! and a double-buffered write-ahead log that makes commits durable.
//!
//! ## Quick Start
//!
//! ```ignore
//! use slabdb::{Engine, IndexDef, KeyField, KeySpec, TableDef};
//!
//! let engine = Engine::default();
//! let db = engine
//!     .database("app")
//!     .path("./app-data")
//!     .table(
//!         TableDef::new("users", 12)
//!             .with_index(IndexDef::new("pk", KeySpec::new([KeyField::binary(0, 4)])?).unique()),
//!     )
//!     .open()?;
//!
//! let users = db.table("users").unwrap();
//! let mut conn = engine.connect();
//! let id = conn.insert(&users, &row_bytes, None)?;
//!
//! let reader = conn.read(&users)?;
//! let found = reader.lookup_unique("pk", &[&row_bytes[..4]])?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Engine (registry, flusher)        │
//! ├─────────────────────────────────────┤
//! │   Connection (begin/commit/rollback)│
//! ├──────────────────┬──────────────────┤
//! │  Database/Table  │  WAL (2 segments)│
//! ├──────────────────┴──────────────────┤
//! │   Hash Index     │   Var Store      │
//! ├─────────────────────────────────────┤
//! │   Arena (slots, free list, growth)  │
//! ├─────────────────────────────────────┤
//! │   Region (Vec<u8> or MmapMut)       │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants and runtime options
//! - [`error`]: typed failure conditions carried inside `eyre` reports
//! - [`storage`]: regions, arenas, row states, var data, file locks
//! - [`index`]: key specifications and the chained hash index
//! - [`txn`]: bitmaps, table locks, visibility, connections
//! - [`wal`]: record formats, segments, append/replay/switch
//! - [`database`]: tables, databases, recovery
//! - [`engine`]: the owned context everything hangs off

#[macro_use]
mod macros;

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod index;
pub mod storage;
pub mod txn;
pub mod wal;

pub use config::{DatabaseOptions, EngineOptions, LockMode, SyncMode, TableOptions};
pub use database::{Database, DatabaseBuilder, IndexDef, RecoveryReport, Table, TableDef};
pub use engine::Engine;
pub use error::CoreError;
pub use index::{HashIndex, KeyField, KeyKind, KeySpec};
pub use storage::{Arena, RowId, RowState};
pub use txn::{CommitOutcome, Connection, TableReader};
pub use wal::{SwitchOutcome, WalStats};
