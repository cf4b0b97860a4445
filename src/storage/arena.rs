//! # Block Arena
//!
//! A growable, contiguous region of fixed-size slots backing one logical
//! object: a table's rows, an index's hash nodes or buckets, a var-data size
//! class, or a WAL segment.
//!
//! ## Layout
//!
//! ```text
//! +---------------------+  0
//! | ArenaHeader (64B)   |
//! +---------------------+  64
//! | extension area      |  owned by the structure on top (may be empty)
//! +---------------------+  slot_offset
//! | slot 1              |
//! | slot 2              |
//! | ...                 |
//! | slot capacity       |
//! +---------------------+  slot_offset + capacity * slot_size
//! ```
//!
//! Slot `id` (1-based) starts at `slot_offset + (id - 1) * slot_size`. Id 0 is
//! the null link.
//!
//! ## Allocation
//!
//! Free slots form a singly linked list threaded through their first four
//! bytes. `allocate` pops the head; when the list is empty it bumps `max_id`,
//! doubling capacity first if every slot has been handed out. `free` pushes
//! the id back as the new head.
//!
//! Arenas created with `NO_ALLOC` are addressed externally (hash nodes share
//! row ids with their table, buckets are plain arrays, WAL segments are byte
//! logs). Only [`Arena::truncate`] and [`Arena::ensure_capacity`] change their
//! size.
//!
//! ## Control Byte
//!
//! Row arenas configure a control byte offset inside each slot. Its low two
//! bits carry the [`RowState`]. The offset must lie past the free-list link so
//! freeing a slot does not clobber it.
//!
//! ## Addressing
//!
//! Slices are re-derived from the current mapping on every call. Holding a
//! slice across an operation that may grow the arena is rejected by the
//! borrow checker, since growth takes `&mut self`.

use std::path::Path;

use eyre::{bail, ensure, Result};
use tracing::debug;
use zerocopy::FromBytes;

use super::headers::{flags, ArenaHeader, ArenaKind};
use super::region::{HeapRegion, MmapRegion, Region};
use super::row_state::RowState;
use super::RowId;
use crate::config::{ARENA_HEADER_SIZE, FREE_LINK_SIZE, ROWID_MASK};
use crate::error::CoreError;

/// Where an arena's bytes live.
#[derive(Debug, Clone, Copy)]
pub enum Backing<'a> {
    Memory,
    File(&'a Path),
}

/// Shape of an arena, fixed at creation.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub kind: ArenaKind,
    pub slot_size: u32,
    pub control_offset: Option<u32>,
    /// Bytes reserved between the header and slot 1.
    pub extension_size: u16,
    pub capacity: u32,
    pub flags: u8,
    /// Capacity ceiling; 0 means unbounded.
    pub limit: u32,
}

impl ArenaConfig {
    pub fn new(kind: ArenaKind, slot_size: u32, capacity: u32) -> Self {
        Self {
            kind,
            slot_size,
            control_offset: None,
            extension_size: 0,
            capacity,
            flags: 0,
            limit: 0,
        }
    }

    pub fn with_control_offset(mut self, offset: u32) -> Self {
        self.control_offset = Some(offset);
        self
    }

    pub fn with_extension(mut self, size: u16) -> Self {
        self.extension_size = size;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    fn slot_offset(&self) -> usize {
        ARENA_HEADER_SIZE + self.extension_size as usize
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.slot_size > 0, "{} slot size must be non-zero", self.kind.name());
        ensure!(self.capacity > 0, "{} capacity must be non-zero", self.kind.name());
        ensure!(
            self.slot_offset() <= u16::MAX as usize,
            "{} extension area too large",
            self.kind.name()
        );
        if self.flags & flags::NO_ALLOC == 0 {
            ensure!(
                self.slot_size as usize >= FREE_LINK_SIZE,
                "{} slot size {} cannot hold a free-list link",
                self.kind.name(),
                self.slot_size
            );
        }
        if let Some(offset) = self.control_offset {
            ensure!(
                offset as usize >= FREE_LINK_SIZE && offset < self.slot_size,
                "{} control offset {} must lie in [{}, {})",
                self.kind.name(),
                offset,
                FREE_LINK_SIZE,
                self.slot_size
            );
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Arena {
    region: Region,
    kind: ArenaKind,
    slot_size: usize,
    slot_offset: usize,
    control_offset: Option<usize>,
}

impl Arena {
    /// Opens an existing arena file or creates a zero-filled one.
    ///
    /// Reopening validates the stored header against `config`; the stored
    /// capacity wins over `config.capacity`.
    pub fn open(backing: Backing<'_>, config: &ArenaConfig) -> Result<Self> {
        config.validate()?;

        let slot_offset = config.slot_offset();
        let initial_len = slot_offset + config.capacity as usize * config.slot_size as usize;

        let (region, created) = match backing {
            Backing::Memory => (Region::Heap(HeapRegion::new(initial_len)?), true),
            Backing::File(path) => {
                let (region, created) = MmapRegion::open_or_create(path, initial_len)?;
                (Region::Mapped(region), created)
            }
        };

        let mut arena = Self {
            region,
            kind: config.kind,
            slot_size: config.slot_size as usize,
            slot_offset,
            control_offset: config.control_offset.map(|o| o as usize),
        };

        if created {
            let mut header = ArenaHeader::new(
                config.kind,
                config.slot_size,
                config.control_offset.unwrap_or(0),
                slot_offset as u16,
                config.flags,
                config.capacity,
            );
            header.set_limit(config.limit);
            header.write_to(arena.region.as_mut_slice());
        } else {
            arena.validate_existing(config)?;
        }

        Ok(arena)
    }

    fn validate_existing(&self, config: &ArenaConfig) -> Result<()> {
        let what = match self.region.path() {
            Some(p) => p.display().to_string(),
            None => self.kind.name().to_string(),
        };
        let header = match ArenaHeader::from_bytes(self.region.as_slice()) {
            Ok(h) => h,
            Err(e) => bail!(CoreError::Corruption {
                what: format!("{}: {}", what, e),
            }),
        };

        let expected_control = config.control_offset.unwrap_or(0);
        let consistent = header.kind() == Some(config.kind)
            && header.slot_size() == config.slot_size
            && header.control_offset() == expected_control
            && header.slot_offset() as usize == self.slot_offset
            && header.capacity() > 0
            && header.max_id() <= header.capacity()
            && header.allocated() <= header.max_id();
        if !consistent {
            bail!(CoreError::Corruption {
                what: format!(
                    "{}: header does not match a {} with slot size {}",
                    what,
                    config.kind.name(),
                    config.slot_size
                ),
            });
        }

        let needed = self.slot_offset + header.capacity() as usize * self.slot_size;
        if self.region.len() < needed {
            bail!(CoreError::Corruption {
                what: format!(
                    "{}: file holds {} bytes but capacity {} needs {}",
                    what,
                    self.region.len(),
                    header.capacity(),
                    needed
                ),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn header(&self) -> &ArenaHeader {
        match ArenaHeader::ref_from_prefix(self.region.as_slice()) {
            Ok((header, _)) => header,
            Err(_) => unreachable!("arena region is shorter than its header"),
        }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut ArenaHeader {
        match ArenaHeader::mut_from_prefix(self.region.as_mut_slice()) {
            Ok((header, _)) => header,
            Err(_) => unreachable!("arena region is shorter than its header"),
        }
    }

    pub fn kind(&self) -> ArenaKind {
        self.kind
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_offset(&self) -> usize {
        self.slot_offset
    }

    pub fn capacity(&self) -> u32 {
        self.header().capacity()
    }

    pub fn max_id(&self) -> RowId {
        self.header().max_id()
    }

    pub fn allocated(&self) -> u32 {
        self.header().allocated()
    }

    pub fn free_head(&self) -> RowId {
        self.header().free_head()
    }

    pub fn is_persistent(&self) -> bool {
        self.region.is_persistent()
    }

    pub fn path(&self) -> Option<&Path> {
        self.region.path()
    }

    /// Total mapped bytes, header included.
    pub fn byte_len(&self) -> usize {
        self.region.len()
    }

    /// Bytes between the header and slot 1.
    pub fn extension(&self) -> &[u8] {
        &self.region.as_slice()[ARENA_HEADER_SIZE..self.slot_offset]
    }

    pub fn extension_mut(&mut self) -> &mut [u8] {
        let end = self.slot_offset;
        &mut self.region.as_mut_slice()[ARENA_HEADER_SIZE..end]
    }

    /// Raw bytes of the whole region.
    pub fn bytes(&self) -> &[u8] {
        self.region.as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.region.as_mut_slice()
    }

    #[inline]
    fn slot_start(&self, id: RowId) -> usize {
        debug_assert!(id >= 1 && id <= self.capacity(), "slot {} out of range", id);
        self.slot_offset + (id as usize - 1) * self.slot_size
    }

    #[inline]
    pub fn slot(&self, id: RowId) -> &[u8] {
        let start = self.slot_start(id);
        &self.region.as_slice()[start..start + self.slot_size]
    }

    #[inline]
    pub fn slot_mut(&mut self, id: RowId) -> &mut [u8] {
        let start = self.slot_start(id);
        let size = self.slot_size;
        &mut self.region.as_mut_slice()[start..start + size]
    }

    /// Slot bytes if `id` lies inside the current capacity.
    pub fn try_slot(&self, id: RowId) -> Option<&[u8]> {
        if id == 0 || id > self.capacity() {
            return None;
        }
        Some(self.slot(id))
    }

    #[inline]
    fn link(&self, id: RowId) -> RowId {
        let slot = self.slot(id);
        u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]])
    }

    #[inline]
    fn set_link(&mut self, id: RowId, next: RowId) {
        self.slot_mut(id)[..FREE_LINK_SIZE].copy_from_slice(&next.to_le_bytes());
    }

    pub fn has_control(&self) -> bool {
        self.control_offset.is_some()
    }

    /// State of slot `id`. Arenas without a control byte report Committed for
    /// every id up to `max_id`.
    #[inline]
    pub fn row_state(&self, id: RowId) -> RowState {
        match self.control_offset {
            Some(offset) => RowState::from_control(self.slot(id)[offset]),
            None if id >= 1 && id <= self.max_id() => RowState::Committed,
            None => RowState::Free,
        }
    }

    #[inline]
    pub fn set_row_state(&mut self, id: RowId, state: RowState) {
        if let Some(offset) = self.control_offset {
            let slot = self.slot_mut(id);
            slot[offset] = state.apply(slot[offset]);
        }
    }

    /// Hands out a slot, growing the arena when every slot is in use.
    ///
    /// The slot's contents are whatever its previous owner left behind, apart
    /// from the control byte which reads Dirty.
    pub fn allocate(&mut self) -> Result<RowId> {
        ensure!(
            !self.header().has_flag(flags::NO_ALLOC),
            "{} is externally addressed",
            self.kind.name()
        );

        let head = self.header().free_head();
        let id = if head != 0 {
            let next = self.link(head);
            let header = self.header_mut();
            header.set_free_head(next);
            if next == 0 {
                header.set_free_tail(0);
            }
            head
        } else {
            let (max_id, capacity, limit) = {
                let h = self.header();
                (h.max_id(), h.capacity(), id_ceiling(h.limit()))
            };
            if max_id == capacity {
                if capacity >= limit {
                    bail!(CoreError::OutOfSpace {
                        object: self.kind.name(),
                        limit: limit as u64,
                    });
                }
                self.truncate(capacity.saturating_mul(2).min(limit))?;
            }
            let id = max_id + 1;
            self.header_mut().set_max_id(id);
            id
        };

        self.set_row_state(id, RowState::Dirty);
        let header = self.header_mut();
        header.set_allocated(header.allocated() + 1);
        Ok(id)
    }

    pub fn allocate_slot(&mut self) -> Result<(RowId, &mut [u8])> {
        let id = self.allocate()?;
        Ok((id, self.slot_mut(id)))
    }

    /// Returns `id` to the free list. The caller must already have removed
    /// it from every index.
    pub fn free(&mut self, id: RowId) {
        debug_assert!(id >= 1 && id <= self.max_id(), "freeing unallocated slot {}", id);
        self.set_row_state(id, RowState::Free);

        let head = self.header().free_head();
        self.set_link(id, head);
        let header = self.header_mut();
        header.set_free_head(id);
        if head == 0 {
            header.set_free_tail(id);
        }
        header.set_allocated(header.allocated().saturating_sub(1));
    }

    /// Resizes the slot array to `new_capacity` slots.
    ///
    /// Never drops below `max_id`. Space added by growth is zeroed.
    pub fn truncate(&mut self, new_capacity: u32) -> Result<()> {
        let (old_capacity, max_id, zero_on_grow) = {
            let h = self.header();
            (h.capacity(), h.max_id(), h.has_flag(flags::ZERO_ON_GROW))
        };
        ensure!(
            new_capacity >= max_id.max(1),
            "cannot shrink {} below max id {}",
            self.kind.name(),
            max_id
        );
        if new_capacity == old_capacity {
            return Ok(());
        }

        let old_len = self.slot_offset + old_capacity as usize * self.slot_size;
        let new_len = self.slot_offset + new_capacity as usize * self.slot_size;
        self.region.resize(new_len)?;
        if zero_on_grow && new_len > old_len {
            self.region.as_mut_slice()[old_len..new_len].fill(0);
        }
        self.header_mut().set_capacity(new_capacity);

        debug!(
            arena = self.kind.name(),
            from = old_capacity,
            to = new_capacity,
            "arena resized"
        );
        Ok(())
    }

    /// Alias of [`Arena::truncate`] restricted to growth.
    pub fn grow(&mut self, new_capacity: u32) -> Result<()> {
        if new_capacity <= self.capacity() {
            return Ok(());
        }
        self.truncate(new_capacity)
    }

    /// Doubles capacity until it covers `min_capacity` slots.
    pub fn ensure_capacity(&mut self, min_capacity: u32) -> Result<()> {
        let mut capacity = self.capacity();
        if capacity >= min_capacity {
            return Ok(());
        }
        while capacity < min_capacity {
            capacity = capacity.saturating_mul(2);
        }
        self.truncate(capacity)
    }

    /// Makes `id` addressable and counted below `max_id` without touching the
    /// free list. Recovery uses this to place rows at their logged ids and then
    /// calls [`Arena::rebuild_free_list`].
    pub fn claim(&mut self, id: RowId) -> Result<()> {
        ensure!(id != 0, "cannot claim the null row id");
        ensure!(id <= ROWID_MASK, "row id {:#x} carries the flag bit", id);
        self.ensure_capacity(id)?;
        if id > self.max_id() {
            self.header_mut().set_max_id(id);
        }
        Ok(())
    }

    /// Recomputes the free list and allocated count from slot contents.
    ///
    /// `in_use` decides per slot; everything else goes back on the list with
    /// lower ids popped first.
    pub fn rebuild_free_list<F>(&mut self, mut in_use: F) -> u32
    where
        F: FnMut(RowId, &[u8]) -> bool,
    {
        let max_id = self.max_id();
        let mut used = 0u32;
        let mut head = 0u32;
        let mut tail = 0u32;

        for id in (1..=max_id).rev() {
            if in_use(id, self.slot(id)) {
                used += 1;
                continue;
            }
            self.set_row_state(id, RowState::Free);
            self.set_link(id, head);
            if head == 0 {
                tail = id;
            }
            head = id;
        }

        let header = self.header_mut();
        header.set_free_head(head);
        header.set_free_tail(tail);
        header.set_allocated(used);
        used
    }

    /// Ids in `1..=max_id` whose state is Committed or InTransaction.
    pub fn live_ids(&self) -> impl Iterator<Item = RowId> + '_ {
        (1..=self.max_id()).filter(move |&id| self.row_state(id).is_live())
    }

    /// Flushes a byte range of the region. No-op for heap arenas.
    pub fn sync(&self, offset: usize, len: usize, asynchronous: bool) -> Result<()> {
        self.region.flush_range(offset, len, asynchronous)
    }

    pub fn sync_all(&self) -> Result<()> {
        self.region.flush()
    }

    /// Remaps after another process grew the backing file.
    pub fn refresh(&mut self) -> Result<bool> {
        let remapped = self.region.refresh()?;
        if remapped {
            let needed = self.slot_offset + self.capacity() as usize * self.slot_size;
            ensure!(
                self.region.len() >= needed,
                "{} shrank underneath this process",
                self.kind.name()
            );
        }
        Ok(remapped)
    }
}

/// Highest id `allocate` may hand out. Ids never reach the flag bit used by
/// WAL deletes and hash chain heads.
fn id_ceiling(limit: u32) -> u32 {
    if limit == 0 {
        ROWID_MASK
    } else {
        limit.min(ROWID_MASK)
    }
}
