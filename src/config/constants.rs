//! # slabdb Configuration Constants
//!
//! Layout constants for every on-disk structure live here so that the sizes
//! used by the zerocopy headers, the arena slot arithmetic and the WAL writer
//! cannot drift apart. Compile-time assertions pin the relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! ARENA_HEADER_SIZE (64 bytes)
//!       │
//!       ├─> HASH_NODE_SLOT_OFFSET (header + 64-byte hash counters)
//!       │
//!       └─> WAL_LOG_START (header + 64-byte WAL header)
//!             The first commit record starts here. A zeroed commit header
//!             at this offset means the segment is empty.
//!
//! WAL_PAGE_SIZE (4096)
//!       │
//!       └─> WAL segments grow in whole pages, doubling page count.
//!
//! ROWID_MSB (bit 31)
//!       │
//!       ├─> hash node `prev`: set when the link names a bucket, not a node
//!       ├─> hash node `sibling`: set on non-first siblings
//!       └─> WAL row id: set when the row records a delete
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `DEFAULT_ARENA_CAPACITY` is a power of two (bucket masks rely on it)
//! 2. Extension headers end exactly at the slot offsets derived from them
//! 3. The WAL log start is 8-byte aligned so commit headers can be read in place

use std::time::Duration;

// ============================================================================
// ARENA LAYOUT
// ============================================================================

/// Magic number stamped at byte 0 of every arena region.
pub const ARENA_MAGIC: u32 = 0xE7FC_FDFB;

/// Format revision written into new arena headers.
pub const ARENA_REVISION: u32 = 1;

/// Size of the fixed arena header.
pub const ARENA_HEADER_SIZE: usize = 64;

/// Initial slot capacity of a freshly created arena.
pub const DEFAULT_ARENA_CAPACITY: u32 = 8;

const _: () = assert!(
    DEFAULT_ARENA_CAPACITY.is_power_of_two(),
    "DEFAULT_ARENA_CAPACITY must be a power of two for bucket masking"
);

/// Minimum bytes a slot on a free list must hold (the next-free link).
pub const FREE_LINK_SIZE: usize = 4;

// ============================================================================
// ROW IDS
// ============================================================================

/// High bit of a row id, used as an out-of-band flag.
pub const ROWID_MSB: u32 = 0x8000_0000;

/// Mask that strips the flag bit from a row id.
pub const ROWID_MASK: u32 = !ROWID_MSB;

const _: () = assert!(ROWID_MSB & ROWID_MASK == 0, "row id flag overlaps mask");

// ============================================================================
// HASH INDEX LAYOUT
// ============================================================================

/// Size of one hash node (next, prev, sibling, hash).
pub const HASH_NODE_SIZE: usize = 16;

/// Size of the hash counters stored in the node arena's extension header.
pub const HASH_HEADER_SIZE: usize = 64;

/// Byte offset of node 1 in the node arena.
pub const HASH_NODE_SLOT_OFFSET: usize = ARENA_HEADER_SIZE + HASH_HEADER_SIZE;

/// Size of one bucket entry in the bucket arena.
pub const HASH_BUCKET_SIZE: usize = 4;

const _: () = assert!(
    HASH_NODE_SLOT_OFFSET == ARENA_HEADER_SIZE + HASH_HEADER_SIZE,
    "HASH_NODE_SLOT_OFFSET derivation mismatch"
);

// ============================================================================
// WAL LAYOUT
// ============================================================================

/// Growth unit of a WAL segment.
pub const WAL_PAGE_SIZE: usize = 4096;

/// Size of the WAL header stored in the segment's extension area.
pub const WAL_HEADER_SIZE: usize = 64;

/// Byte offset of the first commit record in a segment.
pub const WAL_LOG_START: usize = ARENA_HEADER_SIZE + WAL_HEADER_SIZE;

/// Size of a commit record header.
pub const WAL_COMMIT_HEADER_SIZE: usize = 32;

/// Size of a WAL row header (row_len, row_id, table_id).
pub const WAL_ROW_HEADER_SIZE: usize = 12;

/// Pages a new WAL segment starts with.
pub const WAL_INITIAL_PAGES: u32 = 16;

/// Active segment size beyond which a commit triggers a checkpoint.
pub const DEFAULT_WAL_SWITCH_THRESHOLD: u64 = 256 * 1024 * 1024;

/// WAL segment file names, indexed by segment number.
pub const WAL_FILE_NAMES: [&str; 2] = ["wal0.log", "wal1.log"];

const _: () = assert!(WAL_LOG_START % 8 == 0, "WAL_LOG_START must be 8-byte aligned");

const _: () = assert!(
    WAL_LOG_START + WAL_COMMIT_HEADER_SIZE <= WAL_PAGE_SIZE,
    "the empty-log sentinel must fit in the first WAL page"
);

// ============================================================================
// VARIABLE-LENGTH DATA
// ============================================================================

/// Bits of a var-data slot header that carry the byte length.
pub const VAR_LEN_BITS: u32 = 28;

/// Mask extracting the byte length from a var-data slot header.
pub const VAR_LEN_MASK: u32 = (1 << VAR_LEN_BITS) - 1;

/// Set in a var-data slot header while the slot holds live data.
pub const VAR_IN_USE: u32 = 0x8000_0000;

/// Size of the per-slot header in a var-data arena.
pub const VAR_SLOT_HEADER_SIZE: usize = 4;

/// Largest var-data slot (16 MiB, header included).
pub const VAR_MAX_SLOT_SIZE: usize = 16 * 1024 * 1024;

/// Size of the var-data descriptor embedded in a row slot.
pub const VAR_DESCRIPTOR_SIZE: usize = 8;

/// Descriptor class meaning "no var data attached".
pub const VAR_CLASS_NONE: u8 = 255;

const _: () = assert!(
    VAR_MAX_SLOT_SIZE as u32 - 1 <= VAR_LEN_MASK,
    "VAR_LEN_BITS cannot describe the largest var-data slot"
);

// ============================================================================
// BACKGROUND WORK
// ============================================================================

/// Default period of the engine's background flusher when enabled.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
