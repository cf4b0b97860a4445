//! # Arena Header
//!
//! Every arena region starts with a 64-byte little-endian header. Bytes between
//! the header and `slot_offset` form an extension area owned by the structure
//! built on the arena (hash counters, WAL header). Slot 1 starts at
//! `slot_offset`.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------
//!      0     4  magic (0xE7FCFDFB)
//!      4     4  revision
//!      8     4  slot_size
//!     12     4  control_offset (0 = no control byte)
//!     16     2  slot_offset
//!     18     1  kind
//!     19     1  flags
//!     20     4  free_head
//!     24     4  free_tail
//!     28     4  allocated
//!     32     4  max_id
//!     36     4  capacity
//!     40     4  limit (0 = unbounded)
//!     44    20  reserved
//! ```
//!
//! Invariant: `allocated <= max_id <= capacity`.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{ARENA_HEADER_SIZE, ARENA_MAGIC, ARENA_REVISION};

pub mod flags {
    /// The arena is addressed externally; `allocate` is refused.
    pub const NO_ALLOC: u8 = 0x01;
    /// Newly added space must read as zero.
    pub const ZERO_ON_GROW: u8 = 0x02;
}

/// What an arena backs. Stored so a file opened with the wrong role is caught.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaKind {
    Rows = 1,
    HashNodes = 2,
    HashBuckets = 3,
    VarData = 4,
    Wal = 5,
}

impl ArenaKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ArenaKind::Rows),
            2 => Some(ArenaKind::HashNodes),
            3 => Some(ArenaKind::HashBuckets),
            4 => Some(ArenaKind::VarData),
            5 => Some(ArenaKind::Wal),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArenaKind::Rows => "row arena",
            ArenaKind::HashNodes => "hash node arena",
            ArenaKind::HashBuckets => "hash bucket arena",
            ArenaKind::VarData => "var-data arena",
            ArenaKind::Wal => "WAL segment",
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ArenaHeader {
    magic: U32,
    revision: U32,
    slot_size: U32,
    control_offset: U32,
    slot_offset: U16,
    kind: u8,
    flags: u8,
    free_head: U32,
    free_tail: U32,
    allocated: U32,
    max_id: U32,
    capacity: U32,
    limit: U32,
    reserved: [u8; 20],
}

const _: () = assert!(
    std::mem::size_of::<ArenaHeader>() == ARENA_HEADER_SIZE,
    "ArenaHeader must be exactly 64 bytes"
);

impl ArenaHeader {
    pub fn new(
        kind: ArenaKind,
        slot_size: u32,
        control_offset: u32,
        slot_offset: u16,
        flags: u8,
        capacity: u32,
    ) -> Self {
        Self {
            magic: U32::new(ARENA_MAGIC),
            revision: U32::new(ARENA_REVISION),
            slot_size: U32::new(slot_size),
            control_offset: U32::new(control_offset),
            slot_offset: U16::new(slot_offset),
            kind: kind as u8,
            flags,
            free_head: U32::new(0),
            free_tail: U32::new(0),
            allocated: U32::new(0),
            max_id: U32::new(0),
            capacity: U32::new(capacity),
            limit: U32::new(0),
            reserved: [0; 20],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= ARENA_HEADER_SIZE,
            "buffer too small for ArenaHeader: {} < {}",
            bytes.len(),
            ARENA_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..ARENA_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse ArenaHeader: {:?}", e))?;

        ensure!(
            header.magic.get() == ARENA_MAGIC,
            "invalid arena magic {:#010x}",
            header.magic.get()
        );

        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= ARENA_HEADER_SIZE,
            "buffer too small for ArenaHeader: {} < {}",
            bytes.len(),
            ARENA_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut bytes[..ARENA_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse ArenaHeader: {:?}", e))
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[..ARENA_HEADER_SIZE].copy_from_slice(self.as_bytes());
    }

    pub fn kind(&self) -> Option<ArenaKind> {
        ArenaKind::from_u8(self.kind)
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    le_fields! {
        magic: U32 => u32,
        revision: U32 => u32,
        slot_size: U32 => u32,
        control_offset: U32 => u32,
        slot_offset: U16 => u16,
        free_head: U32 => u32,
        free_tail: U32 => u32,
        allocated: U32 => u32,
        max_id: U32 => u32,
        capacity: U32 => u32,
        limit: U32 => u32,
    }
}
