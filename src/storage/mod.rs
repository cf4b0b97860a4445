//! # Storage Layer
//!
//! Fixed-size slot arenas over heap or memory-mapped regions.
//!
//! ## Module Overview
//!
//! - [`region`]: `Vec<u8>` and `MmapMut` backings behind one enum
//! - [`headers`]: the 64-byte on-disk arena header
//! - [`arena`]: slot allocation, free list, doubling growth, sync
//! - [`row_state`]: the 2-bit lifecycle tag in each row's control byte
//! - [`var_store`]: size-classed arenas for out-of-band variable data
//! - [`file_lock`]: byte-range locks for process-shared tables
//!
//! ## Row Ids
//!
//! A [`RowId`] is the 1-based slot number inside an arena. Zero is the null
//! link. Bit 31 is never part of a valid id and is borrowed as a flag by the
//! hash index and the WAL.

pub mod arena;
pub mod file_lock;
pub mod headers;
pub mod region;
pub mod row_state;
pub mod var_store;

pub use arena::{Arena, ArenaConfig, Backing};
pub use headers::{ArenaHeader, ArenaKind};
pub use row_state::RowState;
pub use var_store::{VarRef, VarStore};

use crate::config::ROWID_MASK;

pub type RowId = u32;

/// The null row id terminating every intrusive list.
pub const NULL_ROW: RowId = 0;

/// True if `id` can name a slot (non-zero, flag bit clear).
#[inline]
pub fn is_row_id(id: u32) -> bool {
    id != NULL_ROW && id & !ROWID_MASK == 0
}
