//! On-disk WAL structures.
//!
//! ```text
//! segment file
//! +-------------------+------------------+--------------------------------+
//! | ArenaHeader (64)  | WalHeader (64)   | log: commit, commit, ..., 0    |
//! +-------------------+------------------+--------------------------------+
//!
//! commit record
//! +--------------------+-----------------------+-----------------------+
//! | CommitHeader (32)  | row: header + payload | row ...               |
//! +--------------------+-----------------------+-----------------------+
//! ```
//!
//! Rows are padded to 4 bytes. `row_len` is the unpadded length (header
//! included). A delete is a bare header whose `row_id` has bit 31 set; an
//! insert carries the row's full slot followed by its var data.
//!
//! A zeroed commit header terminates the log.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{ROWID_MASK, ROWID_MSB, WAL_COMMIT_HEADER_SIZE, WAL_HEADER_SIZE, WAL_ROW_HEADER_SIZE};
use crate::database::TableId;
use crate::storage::RowId;

/// Per-segment bookkeeping, stored in the segment arena's extension area.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WalHeader {
    commit_id: U64,
    committed_size: U64,
    synced_size: U64,
    synced_commit_id: U64,
    rollback_count: U64,
    segment_size: U64,
    active: u8,
    reserved: [u8; 15],
}

const _: () = assert!(
    std::mem::size_of::<WalHeader>() == WAL_HEADER_SIZE,
    "WalHeader must be exactly 64 bytes"
);

impl WalHeader {
    le_fields! {
        commit_id: U64 => u64,
        committed_size: U64 => u64,
        synced_size: U64 => u64,
        synced_commit_id: U64 => u64,
        rollback_count: U64 => u64,
        segment_size: U64 => u64,
    }

    pub fn is_active(&self) -> bool {
        self.active != 0
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active as u8;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CommitHeader {
    commit_len: U32,
    checksum: U32,
    commit_id: U64,
    timestamp: U64,
    row_count: U32,
    reserved: [u8; 4],
}

const _: () = assert!(
    std::mem::size_of::<CommitHeader>() == WAL_COMMIT_HEADER_SIZE,
    "CommitHeader must be exactly 32 bytes"
);

impl CommitHeader {
    pub fn new(commit_len: u32, commit_id: u64, timestamp: u64, row_count: u32, checksum: u32) -> Self {
        Self {
            commit_len: U32::new(commit_len),
            checksum: U32::new(checksum),
            commit_id: U64::new(commit_id),
            timestamp: U64::new(timestamp),
            row_count: U32::new(row_count),
            reserved: [0; 4],
        }
    }

    le_fields! {
        commit_len: U32 => u32,
        checksum: U32 => u32,
        commit_id: U64 => u64,
        timestamp: U64 => u64,
        row_count: U32 => u32,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WalRowHeader {
    row_len: U32,
    row_id: U32,
    table_id: U32,
}

const _: () = assert!(
    std::mem::size_of::<WalRowHeader>() == WAL_ROW_HEADER_SIZE,
    "WalRowHeader must be exactly 12 bytes"
);

impl WalRowHeader {
    pub fn insert(table_id: TableId, row_id: RowId, payload_len: usize) -> Self {
        Self {
            row_len: U32::new((WAL_ROW_HEADER_SIZE + payload_len) as u32),
            row_id: U32::new(row_id & ROWID_MASK),
            table_id: U32::new(table_id),
        }
    }

    pub fn delete(table_id: TableId, row_id: RowId) -> Self {
        Self {
            row_len: U32::new(WAL_ROW_HEADER_SIZE as u32),
            row_id: U32::new(row_id | ROWID_MSB),
            table_id: U32::new(table_id),
        }
    }

    pub fn row_len(&self) -> usize {
        self.row_len.get() as usize
    }

    pub fn row_id(&self) -> RowId {
        self.row_id.get() & ROWID_MASK
    }

    pub fn table_id(&self) -> TableId {
        self.table_id.get()
    }

    pub fn is_delete(&self) -> bool {
        self.row_id.get() & ROWID_MSB != 0
    }

    /// Bytes the row occupies in the log.
    pub fn padded_len(&self) -> usize {
        padded(self.row_len())
    }
}

#[inline]
pub(crate) const fn padded(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalRowKind<'a> {
    /// Full slot bytes followed by var data.
    Insert(&'a [u8]),
    Delete,
}

/// One logged row change, as seen by the redo callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalRow<'a> {
    pub table_id: TableId,
    pub row_id: RowId,
    pub kind: WalRowKind<'a>,
}
