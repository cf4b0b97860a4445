//! # slabdb Configuration Module
//!
//! - [`constants`]: layout sizes, magic numbers and thresholds shared by the
//!   arena, hash index, var store and WAL
//! - [`options`]: runtime knobs (lock mode, WAL sync mode, initial capacity)
//!   recognised per database and per table

pub mod constants;
pub mod options;

pub use constants::*;
pub use options::{DatabaseOptions, EngineOptions, LockMode, SyncMode, TableOptions};
pub(crate) use options::normalize_capacity;
