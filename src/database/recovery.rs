//! # Recovery
//!
//! Runs once when a persistent database opens, after every declared table's
//! files are mapped and before anyone can connect:
//!
//! ```text
//! 1. redo      backup then active WAL segment; inserts land at their logged
//!              row ids (var data at its logged descriptor), deletes mark the
//!              slot Free
//! 2. repair    Dirty and InTransaction slots become Free; free lists,
//!              counts and var stores are rebuilt from what is Committed
//! 3. index     every hash index is rebuilt from committed rows
//! 4. reset     tables are synced and both WAL segments emptied
//! ```
//!
//! Redo is idempotent: replaying a commit whose changes already reached the
//! table files rewrites the same bytes. Rows for table ids nobody declared are
//! skipped.

use eyre::Result;
use hashbrown::{HashMap, HashSet};
use tracing::{info, info_span, warn};

use super::{Database, StoreWriteGuard, TableId};
use crate::wal::WalRowKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub commits: u64,
    pub rows: u64,
    pub skipped_rows: u64,
    pub torn_tail: bool,
    pub last_commit_id: u64,
    /// Uncommitted slots freed by repair.
    pub reclaimed: u64,
}

impl Database {
    pub(crate) fn recover(&self) -> Result<RecoveryReport> {
        let _span = info_span!("recovery", db = %self.name).entered();
        let tables = self.tables();
        let mut report = RecoveryReport::default();

        if let Some(wal) = &self.wal {
            let wal = wal.lock();
            let mut stores: HashMap<TableId, StoreWriteGuard<'_>> = HashMap::new();
            for table in tables.iter().filter(|t| !t.is_in_memory()) {
                stores.insert(table.id(), table.write_store()?);
            }

            let mut unknown: HashSet<TableId> = HashSet::new();
            let mut skipped = 0u64;
            let summary = wal.replay(|commit_id, row| {
                let Some(store) = stores.get_mut(&row.table_id) else {
                    if unknown.insert(row.table_id) {
                        warn!(table_id = row.table_id, "WAL names an undeclared table, skipping its rows");
                    }
                    skipped += 1;
                    return Ok(());
                };
                match row.kind {
                    WalRowKind::Insert(payload) => {
                        if let Err(e) = store.redo_insert(row.row_id, payload) {
                            warn!(
                                commit_id,
                                table_id = row.table_id,
                                row = row.row_id,
                                error = %e,
                                "row could not be replayed"
                            );
                            skipped += 1;
                        }
                    }
                    WalRowKind::Delete => store.redo_delete(row.row_id),
                }
                Ok(())
            })?;

            report.commits = summary.commits;
            report.rows = summary.rows.saturating_sub(skipped);
            report.skipped_rows = skipped;
            report.torn_tail = summary.torn;
            report.last_commit_id = summary.last_commit_id;
        }

        for table in &tables {
            report.reclaimed += table.finish_open()?.reclaimed as u64;
        }

        if let Some(wal) = &self.wal {
            let mut wal = wal.lock();
            self.sync_tables()?;
            wal.reset_all()?;
        }

        info!(
            commits = report.commits,
            rows = report.rows,
            skipped = report.skipped_rows,
            reclaimed = report.reclaimed,
            torn_tail = report.torn_tail,
            "recovery complete"
        );
        *self.recovery.lock() = report;
        Ok(report)
    }
}
