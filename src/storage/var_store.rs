//! # Variable-Length Data Store
//!
//! Rows are fixed-size. A table that carries variable-length data stores it
//! out of band and keeps an 8-byte descriptor inside the row:
//!
//! ```text
//! descriptor: class u8 | reserved [u8; 3] | vid u32 (LE)
//! class 255 = no data attached
//! ```
//!
//! Data lives in one arena per size class. Class sizes include a 4-byte slot
//! header and grow geometrically, four steps per power of two:
//!
//! ```text
//! class   0..3   16, 32, 48, 64
//! class   4..7   80, 96, 112, 128
//! class   8..11  160, 192, 224, 256
//! ...
//! class  72..75  10M, 12M, 14M, 16M
//! ```
//!
//! Slot header: bit 31 = in use, low 28 bits = payload length. A freed slot
//! has its first four bytes overwritten by the free-list link, which clears
//! the in-use bit.
//!
//! Class arenas are created on first use. Persistent tables keep them in
//! `T{table:06}.V{class:02}` next to the row file.

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result};
use hashbrown::HashSet;
use tracing::debug;

use super::arena::{Arena, ArenaConfig, Backing};
use super::headers::ArenaKind;
use super::RowId;
use crate::config::{
    DEFAULT_ARENA_CAPACITY, VAR_CLASS_NONE, VAR_DESCRIPTOR_SIZE, VAR_IN_USE, VAR_LEN_MASK,
    VAR_MAX_SLOT_SIZE, VAR_SLOT_HEADER_SIZE,
};
use crate::error::CoreError;

pub const VAR_CLASS_COUNT: usize = 76;

const fn build_class_sizes() -> [u32; VAR_CLASS_COUNT] {
    let mut sizes = [0u32; VAR_CLASS_COUNT];
    let mut class = 0;
    while class < VAR_CLASS_COUNT {
        sizes[class] = if class < 4 {
            16 * (class as u32 + 1)
        } else {
            let k = class as u32 - 4;
            let base = 64u32 << (k / 4);
            base + base * (k % 4 + 1) / 4
        };
        class += 1;
    }
    sizes
}

static CLASS_SIZES: [u32; VAR_CLASS_COUNT] = build_class_sizes();

const _: () = assert!(
    build_class_sizes()[VAR_CLASS_COUNT - 1] as usize == VAR_MAX_SLOT_SIZE,
    "largest var class must equal VAR_MAX_SLOT_SIZE"
);

/// Slot size of `class`, header included.
pub fn class_size(class: u8) -> usize {
    CLASS_SIZES[class as usize] as usize
}

/// Smallest class whose slots hold `len` payload bytes.
pub fn class_for(len: usize) -> Option<u8> {
    let needed = len + VAR_SLOT_HEADER_SIZE;
    let class = CLASS_SIZES.partition_point(|&size| (size as usize) < needed);
    (class < VAR_CLASS_COUNT).then_some(class as u8)
}

/// Location of one value inside a [`VarStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub class: u8,
    pub vid: RowId,
}

impl VarRef {
    /// Reads the descriptor stored at `offset` of a row slot.
    pub fn read(slot: &[u8], offset: usize) -> Option<VarRef> {
        let d = &slot[offset..offset + VAR_DESCRIPTOR_SIZE];
        let class = d[0];
        let vid = u32::from_le_bytes([d[4], d[5], d[6], d[7]]);
        if class == VAR_CLASS_NONE || class as usize >= VAR_CLASS_COUNT || vid == 0 {
            return None;
        }
        Some(VarRef { class, vid })
    }

    /// Writes `var` (or the empty descriptor) at `offset` of a row slot.
    pub fn write(var: Option<VarRef>, slot: &mut [u8], offset: usize) {
        let d = &mut slot[offset..offset + VAR_DESCRIPTOR_SIZE];
        d.fill(0);
        match var {
            Some(v) => {
                d[0] = v.class;
                d[4..8].copy_from_slice(&v.vid.to_le_bytes());
            }
            None => d[0] = VAR_CLASS_NONE,
        }
    }
}

#[derive(Debug)]
pub struct VarStore {
    dir: Option<PathBuf>,
    file_prefix: String,
    classes: Vec<Option<Arena>>,
}

impl VarStore {
    /// Opens the store for one table, picking up class files that already
    /// exist when `dir` is set.
    pub fn open(dir: Option<&Path>, file_prefix: &str) -> Result<Self> {
        let mut store = Self {
            dir: dir.map(Path::to_path_buf),
            file_prefix: file_prefix.to_string(),
            classes: (0..VAR_CLASS_COUNT).map(|_| None).collect(),
        };

        if store.dir.is_some() {
            for class in 0..VAR_CLASS_COUNT as u8 {
                if let Some(path) = store.class_path(class) {
                    if path.exists() {
                        store.open_class(class)?;
                    }
                }
            }
        }
        Ok(store)
    }

    fn class_path(&self, class: u8) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{}.V{:02}", self.file_prefix, class)))
    }

    fn open_class(&mut self, class: u8) -> Result<&mut Arena> {
        let slot = &mut self.classes[class as usize];
        if slot.is_none() {
            let config = ArenaConfig::new(
                ArenaKind::VarData,
                CLASS_SIZES[class as usize],
                DEFAULT_ARENA_CAPACITY,
            );
            let path = self
                .dir
                .as_ref()
                .map(|d| d.join(format!("{}.V{:02}", self.file_prefix, class)));
            let backing = match &path {
                Some(p) => Backing::File(p),
                None => Backing::Memory,
            };
            *slot = Some(Arena::open(backing, &config)?);
            debug!(class, size = CLASS_SIZES[class as usize], "var-data class opened");
        }
        match slot {
            Some(arena) => Ok(arena),
            None => unreachable!("var class arena was just opened"),
        }
    }

    fn write_slot(arena: &mut Arena, vid: RowId, data: &[u8]) {
        let slot = arena.slot_mut(vid);
        let header = VAR_IN_USE | data.len() as u32;
        slot[..VAR_SLOT_HEADER_SIZE].copy_from_slice(&header.to_le_bytes());
        slot[VAR_SLOT_HEADER_SIZE..VAR_SLOT_HEADER_SIZE + data.len()].copy_from_slice(data);
    }

    pub fn store(&mut self, data: &[u8]) -> Result<VarRef> {
        let Some(class) = class_for(data.len()) else {
            bail!(CoreError::OutOfSpace {
                object: "var-data store",
                limit: (VAR_MAX_SLOT_SIZE - VAR_SLOT_HEADER_SIZE) as u64,
            });
        };
        let arena = self.open_class(class)?;
        let vid = arena.allocate()?;
        Self::write_slot(arena, vid, data);
        Ok(VarRef { class, vid })
    }

    /// Writes `data` at a fixed location. Recovery replays values into the
    /// slots they occupied when logged.
    pub fn place(&mut self, var: VarRef, data: &[u8]) -> Result<()> {
        ensure!(
            (var.class as usize) < VAR_CLASS_COUNT,
            "var class {} out of range",
            var.class
        );
        ensure!(
            data.len() + VAR_SLOT_HEADER_SIZE <= class_size(var.class),
            "{} bytes do not fit var class {}",
            data.len(),
            var.class
        );
        let arena = self.open_class(var.class)?;
        arena.claim(var.vid)?;
        Self::write_slot(arena, var.vid, data);
        Ok(())
    }

    pub fn get(&self, var: VarRef) -> Option<&[u8]> {
        let arena = self.classes.get(var.class as usize)?.as_ref()?;
        if var.vid > arena.max_id() {
            return None;
        }
        let slot = arena.try_slot(var.vid)?;
        let header = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
        if header & VAR_IN_USE == 0 {
            return None;
        }
        let len = (header & VAR_LEN_MASK) as usize;
        slot.get(VAR_SLOT_HEADER_SIZE..VAR_SLOT_HEADER_SIZE + len)
    }

    pub fn release(&mut self, var: VarRef) {
        if let Some(Some(arena)) = self.classes.get_mut(var.class as usize) {
            if var.vid >= 1 && var.vid <= arena.max_id() {
                arena.free(var.vid);
            }
        }
    }

    /// Keeps exactly the `referenced` slots and frees everything else.
    pub fn rebuild(&mut self, referenced: &HashSet<VarRef>) -> u32 {
        let mut kept = 0;
        for (class, arena) in self.classes.iter_mut().enumerate() {
            let Some(arena) = arena else { continue };
            kept += arena.rebuild_free_list(|vid, _| {
                referenced.contains(&VarRef {
                    class: class as u8,
                    vid,
                })
            });
        }
        kept
    }

    pub fn allocated(&self) -> u64 {
        self.classes
            .iter()
            .flatten()
            .map(|a| a.allocated() as u64)
            .sum()
    }

    pub fn sync_all(&self) -> Result<()> {
        for arena in self.classes.iter().flatten() {
            arena.sync_all()?;
        }
        Ok(())
    }

    pub fn refresh(&mut self) -> Result<()> {
        for arena in self.classes.iter_mut().flatten() {
            arena.refresh()?;
        }
        Ok(())
    }
}
