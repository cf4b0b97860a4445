//! One WAL segment file: an externally addressed arena of 4 KiB pages with
//! the [`WalHeader`] in its extension area. Offsets are absolute byte
//! positions in the file; the log starts at `WAL_LOG_START`.

use std::path::Path;

use eyre::{bail, Result};
use tracing::{debug, warn};
use zerocopy::FromBytes;

use super::record::{padded, CommitHeader, WalHeader, WalRow, WalRowHeader, WalRowKind};
use super::CRC32;
use crate::config::{
    WAL_COMMIT_HEADER_SIZE, WAL_HEADER_SIZE, WAL_INITIAL_PAGES, WAL_LOG_START, WAL_PAGE_SIZE,
    WAL_ROW_HEADER_SIZE,
};
use crate::error::CoreError;
use crate::storage::headers::flags;
use crate::storage::{Arena, ArenaConfig, ArenaKind, Backing};

/// What a pass over a segment found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub commits: u64,
    pub rows: u64,
    pub last_commit_id: u64,
    /// Offset just past the last valid commit.
    pub end: usize,
    /// A record failed validation and everything from it on was ignored.
    pub torn: bool,
}

#[derive(Debug)]
pub struct WalSegment {
    arena: Arena,
}

impl WalSegment {
    pub fn open(path: &Path) -> Result<Self> {
        let config = ArenaConfig::new(ArenaKind::Wal, WAL_PAGE_SIZE as u32, WAL_INITIAL_PAGES)
            .with_extension(WAL_HEADER_SIZE as u16)
            .with_flags(flags::NO_ALLOC | flags::ZERO_ON_GROW);
        let arena = Arena::open(Backing::File(path), &config)?;
        let mut segment = Self { arena };

        let len = segment.arena.byte_len() as u64;
        let header = segment.header_mut();
        if header.committed_size() < WAL_LOG_START as u64 {
            header.set_committed_size(WAL_LOG_START as u64);
            header.set_synced_size(WAL_LOG_START as u64);
        }
        if header.committed_size() > len {
            bail!(CoreError::Corruption {
                what: format!(
                    "{}: committed size {} beyond segment length {}",
                    path.display(),
                    header.committed_size(),
                    len
                ),
            });
        }
        header.set_segment_size(len);
        Ok(segment)
    }

    pub fn header(&self) -> &WalHeader {
        match WalHeader::ref_from_bytes(self.arena.extension()) {
            Ok(h) => h,
            Err(_) => unreachable!("WAL segment extension is sized for WalHeader"),
        }
    }

    pub fn header_mut(&mut self) -> &mut WalHeader {
        match WalHeader::mut_from_bytes(self.arena.extension_mut()) {
            Ok(h) => h,
            Err(_) => unreachable!("WAL segment extension is sized for WalHeader"),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.arena.path()
    }

    pub fn len(&self) -> usize {
        self.arena.byte_len()
    }

    pub fn committed_size(&self) -> usize {
        self.header().committed_size() as usize
    }

    /// Log bytes written since the last reset.
    pub fn used(&self) -> u64 {
        (self.committed_size() - WAL_LOG_START) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.committed_size() <= WAL_LOG_START
    }

    /// Grows the file until byte `end` is addressable.
    pub(crate) fn ensure_room(&mut self, end: usize) -> Result<()> {
        if end <= self.arena.byte_len() {
            return Ok(());
        }
        let pages = (end - WAL_LOG_START).div_ceil(WAL_PAGE_SIZE);
        let pages = u32::try_from(pages).map_err(|_| CoreError::OutOfSpace {
            object: "WAL segment",
            limit: u32::MAX as u64,
        })?;
        self.arena.ensure_capacity(pages)?;
        let len = self.arena.byte_len() as u64;
        self.header_mut().set_segment_size(len);
        Ok(())
    }

    pub(crate) fn log_mut(&mut self, start: usize, len: usize) -> &mut [u8] {
        &mut self.arena.bytes_mut()[start..start + len]
    }

    /// Makes the commit ending at `end` part of the log.
    pub(crate) fn publish(&mut self, end: usize, commit_id: u64) {
        let header = self.header_mut();
        header.set_committed_size(end as u64);
        header.set_commit_id(commit_id);
    }

    /// Flushes unsynced log bytes and then the header.
    pub(crate) fn sync(&mut self) -> Result<()> {
        let (from, committed, commit_id) = {
            let h = self.header();
            (h.synced_size() as usize, h.committed_size() as usize, h.commit_id())
        };
        // The sentinel after the last commit goes out with it.
        let to = (committed + WAL_COMMIT_HEADER_SIZE).min(self.arena.byte_len());
        if to > from {
            self.arena.sync(from, to - from, false)?;
        }
        let header = self.header_mut();
        header.set_synced_size(committed as u64);
        header.set_synced_commit_id(commit_id);
        self.arena.sync(0, WAL_LOG_START, false)
    }

    /// Starts writeback of the log bytes past the synced size without
    /// waiting for it. The synced size and commit id stay put.
    pub(crate) fn flush_async(&self) -> Result<()> {
        let h = self.header();
        let from = h.synced_size() as usize;
        let to = (h.committed_size() as usize + WAL_COMMIT_HEADER_SIZE).min(self.arena.byte_len());
        if to > from {
            self.arena.sync(from, to - from, true)?;
        }
        Ok(())
    }

    /// Empties the log and shrinks the file back to its initial size. The
    /// commit id and rollback counters carry on.
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.log_mut(WAL_LOG_START, WAL_COMMIT_HEADER_SIZE).fill(0);
        if self.arena.capacity() > WAL_INITIAL_PAGES {
            self.arena.truncate(WAL_INITIAL_PAGES)?;
        }
        let len = self.arena.byte_len() as u64;
        let header = self.header_mut();
        header.set_committed_size(WAL_LOG_START as u64);
        header.set_synced_size(WAL_LOG_START as u64);
        header.set_synced_commit_id(header.commit_id());
        header.set_segment_size(len);
        self.arena.sync_all()?;
        debug!(segment = ?self.path(), "WAL segment reset");
        Ok(())
    }

    /// Walks the commits in log order, handing each row to `f`.
    ///
    /// Stops at the zero sentinel, at a commit id not above `floor` or the
    /// previous commit, at a record running off the mapped file, or at a
    /// checksum mismatch. A commit is only handed out once its whole record
    /// validated.
    pub fn scan<F>(&self, floor: u64, mut f: F) -> Result<ScanSummary>
    where
        F: FnMut(u64, WalRow<'_>) -> Result<()>,
    {
        let bytes = self.arena.bytes();
        let mut summary = ScanSummary {
            last_commit_id: floor,
            end: WAL_LOG_START,
            ..ScanSummary::default()
        };
        let mut pos = WAL_LOG_START;
        let mut rows: Vec<WalRow<'_>> = Vec::new();

        while pos + WAL_COMMIT_HEADER_SIZE <= bytes.len() {
            let header = match CommitHeader::read_from_bytes(&bytes[pos..pos + WAL_COMMIT_HEADER_SIZE]) {
                Ok(h) => h,
                Err(_) => unreachable!("slice is exactly one commit header"),
            };
            let commit_len = header.commit_len() as usize;
            if commit_len == 0 {
                break;
            }
            if header.commit_id() <= summary.last_commit_id {
                debug!(
                    at = pos,
                    commit_id = header.commit_id(),
                    "stale commit record ends the log"
                );
                break;
            }
            if commit_len < WAL_COMMIT_HEADER_SIZE || pos + commit_len > bytes.len() {
                warn!(at = pos, commit_len, "torn commit record");
                summary.torn = true;
                break;
            }

            let body = &bytes[pos + WAL_COMMIT_HEADER_SIZE..pos + commit_len];
            if CRC32.checksum(body) != header.checksum() {
                warn!(
                    at = pos,
                    commit_id = header.commit_id(),
                    "WAL checksum mismatch, ignoring the rest of the segment"
                );
                summary.torn = true;
                break;
            }

            rows.clear();
            if !parse_rows(body, &mut rows) || rows.len() != header.row_count() as usize {
                warn!(at = pos, commit_id = header.commit_id(), "malformed rows in commit record");
                summary.torn = true;
                break;
            }

            for row in rows.drain(..) {
                f(header.commit_id(), row)?;
                summary.rows += 1;
            }
            summary.commits += 1;
            summary.last_commit_id = header.commit_id();
            pos += commit_len;
            summary.end = pos;
        }

        Ok(summary)
    }
}

fn parse_rows<'a>(mut body: &'a [u8], out: &mut Vec<WalRow<'a>>) -> bool {
    while !body.is_empty() {
        let Ok((header, _)) = WalRowHeader::read_from_prefix(body) else {
            return false;
        };
        let row_len = header.row_len();
        let step = header.padded_len();
        if row_len < WAL_ROW_HEADER_SIZE || step > body.len() {
            return false;
        }
        let kind = if header.is_delete() {
            WalRowKind::Delete
        } else {
            WalRowKind::Insert(&body[WAL_ROW_HEADER_SIZE..row_len])
        };
        out.push(WalRow {
            table_id: header.table_id(),
            row_id: header.row_id(),
            kind,
        });
        body = &body[step..];
    }
    true
}

/// Bytes a commit with the given rows occupies, header included.
pub(crate) fn commit_size<I: IntoIterator<Item = usize>>(row_lens: I) -> usize {
    WAL_COMMIT_HEADER_SIZE + row_lens.into_iter().map(padded).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use zerocopy::IntoBytes;

    fn write_commit(seg: &mut WalSegment, commit_id: u64, rows: &[(u32, u32, Option<&[u8]>)]) -> usize {
        let size = commit_size(rows.iter().map(|(_, _, p)| WAL_ROW_HEADER_SIZE + p.map_or(0, <[u8]>::len)));
        let start = seg.committed_size();
        seg.ensure_room(start + size + WAL_COMMIT_HEADER_SIZE).unwrap();
        let buf = seg.log_mut(start, size + WAL_COMMIT_HEADER_SIZE);
        let mut pos = WAL_COMMIT_HEADER_SIZE;
        for &(table, id, payload) in rows {
            let h = match payload {
                Some(p) => WalRowHeader::insert(table, id, p.len()),
                None => WalRowHeader::delete(table, id),
            };
            buf[pos..pos + WAL_ROW_HEADER_SIZE].copy_from_slice(h.as_bytes());
            if let Some(p) = payload {
                buf[pos + WAL_ROW_HEADER_SIZE..pos + WAL_ROW_HEADER_SIZE + p.len()].copy_from_slice(p);
            }
            pos += h.padded_len();
        }
        buf[size..].fill(0);
        let checksum = CRC32.checksum(&buf[WAL_COMMIT_HEADER_SIZE..size]);
        let header = CommitHeader::new(size as u32, commit_id, 0, rows.len() as u32, checksum);
        buf[..WAL_COMMIT_HEADER_SIZE].copy_from_slice(header.as_bytes());
        seg.publish(start + size, commit_id);
        start
    }

    fn collect(seg: &WalSegment) -> (ScanSummary, Vec<(u64, u32, bool)>) {
        let mut seen = Vec::new();
        let summary = seg
            .scan(0, |cid, row| {
                seen.push((cid, row.row_id, row.kind == WalRowKind::Delete));
                Ok(())
            })
            .unwrap();
        (summary, seen)
    }

    #[test]
    fn fresh_segment_is_empty() {
        let dir = tempdir().unwrap();
        let seg = WalSegment::open(&dir.path().join("wal0.log")).unwrap();
        assert!(seg.is_empty());
        assert_eq!(seg.len(), WAL_LOG_START + WAL_INITIAL_PAGES as usize * WAL_PAGE_SIZE);
        assert_eq!(collect(&seg).0.commits, 0);
    }

    #[test]
    fn scans_commits_in_order() {
        let dir = tempdir().unwrap();
        let mut seg = WalSegment::open(&dir.path().join("wal0.log")).unwrap();
        write_commit(&mut seg, 1, &[(1, 5, Some(b"abcdefg")), (1, 2, None)]);
        write_commit(&mut seg, 2, &[(1, 6, Some(b"xy"))]);

        let (summary, seen) = collect(&seg);
        assert_eq!(summary.commits, 2);
        assert_eq!(summary.rows, 3);
        assert!(!summary.torn);
        assert_eq!(summary.end, seg.committed_size());
        assert_eq!(seen, vec![(1, 5, false), (1, 2, true), (2, 6, false)]);
    }

    #[test]
    fn checksum_mismatch_truncates_tail() {
        let dir = tempdir().unwrap();
        let mut seg = WalSegment::open(&dir.path().join("wal0.log")).unwrap();
        write_commit(&mut seg, 1, &[(1, 1, Some(b"good"))]);
        let second = write_commit(&mut seg, 2, &[(1, 2, Some(b"torn"))]);
        seg.log_mut(second + WAL_COMMIT_HEADER_SIZE + WAL_ROW_HEADER_SIZE, 1)[0] ^= 0xFF;

        let (summary, seen) = collect(&seg);
        assert!(summary.torn);
        assert_eq!(summary.commits, 1);
        assert_eq!(seen, vec![(1, 1, false)]);
    }

    #[test]
    fn reset_hides_old_commits_and_keeps_ids() {
        let dir = tempdir().unwrap();
        let mut seg = WalSegment::open(&dir.path().join("wal0.log")).unwrap();
        write_commit(&mut seg, 1, &[(1, 1, Some(b"a"))]);
        write_commit(&mut seg, 2, &[(1, 2, Some(b"b"))]);
        seg.reset().unwrap();
        assert!(seg.is_empty());
        assert_eq!(seg.header().commit_id(), 2);
        assert_eq!(collect(&seg).0.commits, 0);
    }

    #[test]
    fn grows_for_large_commits_and_shrinks_on_reset() {
        let dir = tempdir().unwrap();
        let mut seg = WalSegment::open(&dir.path().join("wal0.log")).unwrap();
        let big = vec![7u8; WAL_PAGE_SIZE * WAL_INITIAL_PAGES as usize];
        write_commit(&mut seg, 1, &[(1, 1, Some(&big))]);
        assert!(seg.len() > WAL_LOG_START + big.len());
        assert_eq!(collect(&seg).0.rows, 1);

        seg.reset().unwrap();
        assert_eq!(seg.len(), WAL_LOG_START + WAL_INITIAL_PAGES as usize * WAL_PAGE_SIZE);
    }

    #[test]
    fn reopen_sees_published_commits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal0.log");
        {
            let mut seg = WalSegment::open(&path).unwrap();
            write_commit(&mut seg, 7, &[(2, 3, Some(b"persist"))]);
            seg.sync().unwrap();
        }
        let seg = WalSegment::open(&path).unwrap();
        assert_eq!(seg.header().commit_id(), 7);
        assert_eq!(seg.header().synced_commit_id(), 7);
        let (summary, seen) = collect(&seg);
        assert_eq!(summary.last_commit_id, 7);
        assert_eq!(seen, vec![(7, 3, false)]);
    }
}
