//! # Write-Ahead Log
//!
//! Each persistent database keeps two segment files, `wal0.log` and
//! `wal1.log`. One is active and takes every commit; the other is the backup,
//! holding commits whose table changes have not been synced yet.
//!
//! ## Commit Protocol
//!
//! 1. Rows are written after the active segment's committed end: one bare
//!    header per deleted row, header plus full slot plus var data per inserted
//!    row, deletes before inserts within each table
//! 2. A zeroed commit header is written after them as the end sentinel
//! 3. The commit header (length, id, timestamp, CRC-32C of the rows) is
//!    written last
//! 4. The committed size advances and the segment is synced per [`SyncMode`]
//!
//! Commit ids increase strictly across both segments and survive resets, so a
//! leftover record from before a reset can never pass for a live one.
//!
//! ## Checkpoint
//!
//! [`Wal::switch`] swaps the roles. The caller then syncs every table and
//! calls [`Wal::reset_backup`], after which the old commits are gone. If the
//! backup still holds data the switch is refused with
//! [`SwitchOutcome::Busy`].
//!
//! ## Redo
//!
//! [`Wal::replay`] walks the backup and then the active segment, stopping in
//! each at the first record that fails validation.

mod record;
mod segment;

pub use record::{CommitHeader, WalHeader, WalRow, WalRowHeader, WalRowKind};
pub use segment::{ScanSummary, WalSegment};

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result, WrapErr};
use tracing::{debug, trace};
use zerocopy::IntoBytes;

use crate::config::{SyncMode, WAL_COMMIT_HEADER_SIZE, WAL_FILE_NAMES, WAL_LOG_START, WAL_ROW_HEADER_SIZE};
use crate::database::{TableId, TableStore};
use crate::txn::RowBitmap;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The changes one transaction made to one table, with read access to the
/// rows being logged.
pub struct TableChanges<'a> {
    pub table_id: TableId,
    pub store: &'a TableStore,
    pub inserted: &'a RowBitmap,
    pub deleted: &'a RowBitmap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched,
    /// The active segment holds nothing to checkpoint.
    Empty,
    /// The backup segment has not been drained.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalStats {
    pub active_segment: usize,
    pub commit_id: u64,
    pub synced_commit_id: u64,
    pub rollback_count: u64,
    pub active_bytes: u64,
    pub backup_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub commits: u64,
    pub rows: u64,
    pub last_commit_id: u64,
    pub torn: bool,
}

#[derive(Debug)]
pub struct Wal {
    segments: [WalSegment; 2],
    active: usize,
    sync_mode: SyncMode,
    switch_threshold: u64,
    /// Commits appended since the last sync under `SyncMode::EveryN`.
    unsynced: u64,
}

impl Wal {
    /// Opens (creating if needed) both segments in `dir`.
    pub fn open(dir: &Path, sync_mode: SyncMode, switch_threshold: u64) -> Result<Self> {
        let open = |name: &str| {
            let path = dir.join(name);
            WalSegment::open(&path).wrap_err_with(|| format!("failed to open WAL segment '{}'", path.display()))
        };
        let mut segments = [open(WAL_FILE_NAMES[0])?, open(WAL_FILE_NAMES[1])?];

        let active = match (segments[0].header().is_active(), segments[1].header().is_active()) {
            (false, true) => 1,
            _ => 0,
        };
        let commit_id = segments[0].header().commit_id().max(segments[1].header().commit_id());
        let rollbacks = segments[active].header().rollback_count();
        for (i, segment) in segments.iter_mut().enumerate() {
            let header = segment.header_mut();
            header.set_active(i == active);
            header.set_commit_id(commit_id);
            header.set_rollback_count(rollbacks);
        }

        debug!(dir = %dir.display(), active, commit_id, "WAL opened");
        Ok(Self {
            segments,
            active,
            sync_mode,
            switch_threshold,
            unsynced: 0,
        })
    }

    pub fn active_segment(&self) -> &WalSegment {
        &self.segments[self.active]
    }

    pub fn backup_segment(&self) -> &WalSegment {
        &self.segments[1 - self.active]
    }

    pub fn commit_id(&self) -> u64 {
        self.active_segment().header().commit_id()
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// True once the active segment has outgrown the switch threshold.
    pub fn needs_checkpoint(&self) -> bool {
        self.active_segment().used() >= self.switch_threshold
    }

    /// Logs one transaction. Returns the new commit id, or `None` if there
    /// was nothing to log.
    pub fn append(&mut self, changes: &[TableChanges<'_>]) -> Result<Option<u64>> {
        let mut row_count = 0usize;
        let mut row_lens = Vec::new();
        for t in changes {
            for _ in t.deleted.iter() {
                row_lens.push(WAL_ROW_HEADER_SIZE);
            }
            for id in t.inserted.iter() {
                let (slot, var) = t.store.wal_payload(id);
                row_lens.push(WAL_ROW_HEADER_SIZE + slot.len() + var.len());
            }
            row_count += t.deleted.len() + t.inserted.len();
        }
        if row_count == 0 {
            return Ok(None);
        }

        let size = segment::commit_size(row_lens.iter().copied());
        ensure!(
            size <= u32::MAX as usize,
            "transaction of {} bytes exceeds the WAL record limit",
            size
        );

        let commit_id = self.commit_id() + 1;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let segment = &mut self.segments[self.active];
        let start = segment.committed_size();
        segment.ensure_room(start + size + WAL_COMMIT_HEADER_SIZE)?;

        let buf = segment.log_mut(start, size + WAL_COMMIT_HEADER_SIZE);
        let mut pos = WAL_COMMIT_HEADER_SIZE;
        for t in changes {
            for id in t.deleted.iter() {
                let header = WalRowHeader::delete(t.table_id, id);
                buf[pos..pos + WAL_ROW_HEADER_SIZE].copy_from_slice(header.as_bytes());
                pos += header.padded_len();
            }
            for id in t.inserted.iter() {
                let (slot, var) = t.store.wal_payload(id);
                let header = WalRowHeader::insert(t.table_id, id, slot.len() + var.len());
                let body = pos + WAL_ROW_HEADER_SIZE;
                buf[pos..body].copy_from_slice(header.as_bytes());
                buf[body..body + slot.len()].copy_from_slice(slot);
                buf[body + slot.len()..body + slot.len() + var.len()].copy_from_slice(var);
                buf[pos + header.row_len()..pos + header.padded_len()].fill(0);
                pos += header.padded_len();
            }
        }
        debug_assert_eq!(pos, size);

        buf[size..].fill(0);
        let checksum = CRC32.checksum(&buf[WAL_COMMIT_HEADER_SIZE..size]);
        let header = CommitHeader::new(size as u32, commit_id, timestamp, row_count as u32, checksum);
        buf[..WAL_COMMIT_HEADER_SIZE].copy_from_slice(header.as_bytes());
        segment.publish(start + size, commit_id);

        self.unsynced += 1;
        self.flush()?;
        trace!(commit_id, rows = row_count, bytes = size, "commit logged");
        Ok(Some(commit_id))
    }

    /// Syncs the active segment if the sync mode says it is due, and
    /// otherwise starts an asynchronous flush of what is pending.
    pub fn flush(&mut self) -> Result<()> {
        let Some(interval) = self.sync_mode.interval() else {
            return Ok(());
        };
        if self.unsynced >= interval {
            self.sync()
        } else {
            self.segments[self.active].flush_async()
        }
    }

    /// Syncs the active segment unconditionally.
    pub fn sync(&mut self) -> Result<()> {
        self.segments[self.active].sync()?;
        self.unsynced = 0;
        Ok(())
    }

    pub fn note_rollback(&mut self) {
        let header = self.segments[self.active].header_mut();
        header.set_rollback_count(header.rollback_count() + 1);
    }

    pub fn switch(&mut self) -> Result<SwitchOutcome> {
        let backup = 1 - self.active;
        if !self.segments[backup].is_empty() {
            return Ok(SwitchOutcome::Busy);
        }
        if self.segments[self.active].is_empty() {
            return Ok(SwitchOutcome::Empty);
        }

        self.sync()?;
        let (commit_id, rollbacks) = {
            let h = self.segments[self.active].header();
            (h.commit_id(), h.rollback_count())
        };
        self.segments[self.active].header_mut().set_active(false);
        let header = self.segments[backup].header_mut();
        header.set_active(true);
        header.set_commit_id(commit_id);
        header.set_synced_commit_id(commit_id);
        header.set_rollback_count(rollbacks);
        self.segments[backup].sync()?;
        self.segments[self.active].sync()?;

        debug!(from = self.active, to = backup, commit_id, "WAL switched");
        self.active = backup;
        Ok(SwitchOutcome::Switched)
    }

    /// Drops the backup segment's commits. Only valid once every table they
    /// touched has been synced.
    pub fn reset_backup(&mut self) -> Result<()> {
        self.segments[1 - self.active].reset()
    }

    /// Drops both segments' commits after recovery has synced the tables.
    pub fn reset_all(&mut self) -> Result<()> {
        self.segments[0].reset()?;
        self.segments[1].reset()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Hands every logged row to `f`, oldest commit first.
    pub fn replay<F>(&self, mut f: F) -> Result<ReplaySummary>
    where
        F: FnMut(u64, WalRow<'_>) -> Result<()>,
    {
        let mut summary = ReplaySummary::default();
        for segment in [self.backup_segment(), self.active_segment()] {
            let scanned = segment.scan(summary.last_commit_id, &mut f)?;
            summary.commits += scanned.commits;
            summary.rows += scanned.rows;
            summary.last_commit_id = scanned.last_commit_id;
            summary.torn |= scanned.torn;
        }
        Ok(summary)
    }

    pub fn stats(&self) -> WalStats {
        let active = self.active_segment().header();
        WalStats {
            active_segment: self.active,
            commit_id: active.commit_id(),
            synced_commit_id: active.synced_commit_id(),
            rollback_count: active.rollback_count(),
            active_bytes: self.active_segment().used(),
            backup_bytes: self.backup_segment().used(),
        }
    }
}

const _: () = assert!(WAL_LOG_START % 4 == 0, "WAL log must start 4-byte aligned");
