//! # Backing Regions
//!
//! An arena's bytes live in one of two regions:
//!
//! - [`HeapRegion`]: a `Vec<u8>` for in-memory tables, hash indexes and
//!   var-data of in-memory tables
//! - [`MmapRegion`]: a shared read-write mapping of a file, for persistent
//!   tables, var-data and WAL segments
//!
//! [`Region`] dispatches between them so the arena above is written once.
//!
//! ## Remap Safety
//!
//! Growing a mapped region replaces the mapping, which invalidates every slice
//! handed out before. Resizing takes `&mut self`, and all accessors borrow
//! `&self`, so the borrow checker rules out dangling slot references without
//! epochs or hazard pointers. Callers hold row ids across growth, never
//! slices.
//!
//! ## Sizing
//!
//! Both regions zero-fill bytes added by [`Region::resize`]: `Vec::resize`
//! writes zeros and `File::set_len` extends with a hole that reads as zeros.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::error::CoreError;

#[derive(Debug)]
pub struct HeapRegion {
    bytes: Vec<u8>,
}

impl HeapRegion {
    pub fn new(len: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        if bytes.try_reserve_exact(len).is_err() {
            bail!(CoreError::OutOfMemory {
                object: "heap region",
                requested: len,
            });
        }
        bytes.resize(len, 0);
        Ok(Self { bytes })
    }

    fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.bytes.len() {
            let additional = new_len - self.bytes.len();
            if self.bytes.try_reserve_exact(additional).is_err() {
                bail!(CoreError::OutOfMemory {
                    object: "heap region",
                    requested: new_len,
                });
            }
        }
        self.bytes.resize(new_len, 0);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MmapRegion {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
}

impl MmapRegion {
    /// Opens `path`, creating it with `initial_len` zero bytes if missing.
    ///
    /// Returns the region and whether the file was freshly created.
    pub fn open_or_create<P: AsRef<Path>>(path: P, initial_len: usize) -> Result<(Self, bool)> {
        let path = path.as_ref();
        ensure!(initial_len > 0, "cannot map an empty region");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open region file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        let created = file_size == 0;
        if created {
            file.set_len(initial_len as u64)
                .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), initial_len))?;
        }

        // SAFETY: MmapMut::map_mut is unsafe because the file may be modified
        // outside this mapping. This is sound here because:
        // 1. The file is non-empty (sized above or pre-existing)
        // 2. Other processes only touch it under the table's file-range locks
        // 3. The mapping is owned by this region and dropped with it
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                mmap,
            },
            created,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len == self.mmap.len() {
            return Ok(());
        }

        if let Err(e) = self.file.set_len(new_len as u64) {
            return Err(e).wrap_err(CoreError::OutOfMemory {
                object: "mapped region",
                requested: new_len,
            });
        }

        self.remap()
    }

    fn remap(&mut self) -> Result<()> {
        // SAFETY: The previous mapping is replaced while `&mut self` is held,
        // so no slice into it can still be alive. The file has already been
        // resized to the length the new mapping covers.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .wrap_err_with(|| format!("failed to remap '{}'", self.path.display()))?
        };
        Ok(())
    }

    /// Remaps if another process changed the file length.
    fn refresh(&mut self) -> Result<bool> {
        let file_size = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", self.path.display()))?
            .len() as usize;
        if file_size == self.mmap.len() {
            return Ok(false);
        }
        self.remap()?;
        Ok(true)
    }

    fn flush_range(&self, offset: usize, len: usize, asynchronous: bool) -> Result<()> {
        let end = (offset + len).min(self.mmap.len());
        if offset >= end {
            return Ok(());
        }
        let res = if asynchronous {
            self.mmap.flush_async_range(offset, end - offset)
        } else {
            self.mmap.flush_range(offset, end - offset)
        };
        res.wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }
}

#[derive(Debug)]
pub enum Region {
    Heap(HeapRegion),
    Mapped(MmapRegion),
}

impl Region {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Region::Heap(r) => &r.bytes,
            Region::Mapped(r) => &r.mmap,
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Heap(r) => &mut r.bytes,
            Region::Mapped(r) => &mut r.mmap,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Region::Mapped(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Region::Heap(_) => None,
            Region::Mapped(r) => Some(r.path()),
        }
    }

    /// Grows or shrinks the region to exactly `new_len` bytes.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        match self {
            Region::Heap(r) => r.resize(new_len),
            Region::Mapped(r) => r.resize(new_len),
        }
    }

    /// Picks up a length change made by another process. Heap regions never
    /// change underneath us.
    pub fn refresh(&mut self) -> Result<bool> {
        match self {
            Region::Heap(_) => Ok(false),
            Region::Mapped(r) => r.refresh(),
        }
    }

    pub fn flush_range(&self, offset: usize, len: usize, asynchronous: bool) -> Result<()> {
        match self {
            Region::Heap(_) => Ok(()),
            Region::Mapped(r) => r.flush_range(offset, len, asynchronous),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.flush_range(0, self.len(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn heap_region_grows_zeroed() {
        let mut region = Region::Heap(HeapRegion::new(16).unwrap());
        region.as_mut_slice()[0] = 0xAB;
        region.resize(64).unwrap();

        assert_eq!(region.len(), 64);
        assert_eq!(region.as_slice()[0], 0xAB);
        assert!(region.as_slice()[16..].iter().all(|&b| b == 0));
        assert!(!region.is_persistent());
    }

    #[test]
    fn mapped_region_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.dat");

        {
            let (region, created) = MmapRegion::open_or_create(&path, 4096).unwrap();
            assert!(created);
            let mut region = Region::Mapped(region);
            region.as_mut_slice()[100] = 42;
            region.resize(8192).unwrap();
            region.as_mut_slice()[8000] = 7;
            region.flush().unwrap();
        }

        let (region, created) = MmapRegion::open_or_create(&path, 4096).unwrap();
        assert!(!created);
        let region = Region::Mapped(region);
        assert_eq!(region.len(), 8192);
        assert_eq!(region.as_slice()[100], 42);
        assert_eq!(region.as_slice()[8000], 7);
    }

    #[test]
    fn mapped_region_refresh_sees_external_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.dat");

        let (a, _) = MmapRegion::open_or_create(&path, 4096).unwrap();
        let (b, _) = MmapRegion::open_or_create(&path, 4096).unwrap();
        let mut a = Region::Mapped(a);
        let mut b = Region::Mapped(b);

        a.resize(16384).unwrap();
        a.as_mut_slice()[12000] = 9;

        assert!(b.refresh().unwrap());
        assert_eq!(b.len(), 16384);
        assert_eq!(b.as_slice()[12000], 9);
        assert!(!b.refresh().unwrap());
    }

    #[test]
    fn flush_range_clamps_to_length() {
        let dir = tempdir().unwrap();
        let (region, _) = MmapRegion::open_or_create(dir.path().join("r.dat"), 4096).unwrap();
        let region = Region::Mapped(region);
        region.flush_range(4000, 1000, false).unwrap();
        region.flush_range(5000, 10, true).unwrap();
    }
}
