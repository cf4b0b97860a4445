//! Transaction-level table locks.
//!
//! A connection takes a shared or exclusive hold on a table and keeps it until
//! commit or rollback, across any number of calls. The hold therefore cannot
//! be a borrow-scoped guard; [`TableLock`] is an explicit shared/exclusive
//! lock released by the owner, built on a `parking_lot` mutex and condvar.
//!
//! In [`LockMode::Process`] the first in-process holder also takes the
//! table's file range lock and the last one to leave releases it. POSIX record
//! locks are per process and not counted, so the in-process state is the
//! reference count.

use eyre::Result;
use parking_lot::{Condvar, Mutex};

use crate::config::LockMode;
use crate::storage::file_lock::{LockFile, RangeLockGuard, RangeLockKind, TABLE_LOCK_BYTE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
    file_guard: Option<RangeLockGuard>,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.readers == 0 && !self.writer
    }
}

#[derive(Debug)]
pub struct TableLock {
    mode: LockMode,
    state: Mutex<LockState>,
    released: Condvar,
}

impl TableLock {
    pub fn new(mode: LockMode) -> Self {
        Self {
            mode,
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Blocks until `level` is held. `lock_file` is consulted only in process
    /// mode.
    pub fn acquire(&self, level: LockLevel, lock_file: Option<&LockFile>) -> Result<()> {
        if self.mode == LockMode::NoLock {
            return Ok(());
        }

        let mut state = self.state.lock();
        match level {
            LockLevel::Shared => {
                while state.writer {
                    self.released.wait(&mut state);
                }
            }
            LockLevel::Exclusive => {
                while !state.is_free() {
                    self.released.wait(&mut state);
                }
            }
        }

        if self.mode == LockMode::Process && state.is_free() {
            if let Some(file) = lock_file {
                let kind = match level {
                    LockLevel::Shared => RangeLockKind::Shared,
                    LockLevel::Exclusive => RangeLockKind::Exclusive,
                };
                // The state mutex stays held while other processes drain.
                state.file_guard = Some(file.lock(TABLE_LOCK_BYTE, kind)?);
            }
        }

        match level {
            LockLevel::Shared => state.readers += 1,
            LockLevel::Exclusive => state.writer = true,
        }
        Ok(())
    }

    pub fn release(&self, level: LockLevel) {
        if self.mode == LockMode::NoLock {
            return;
        }

        let mut state = self.state.lock();
        match level {
            LockLevel::Shared => {
                debug_assert!(state.readers > 0, "shared table lock released twice");
                state.readers = state.readers.saturating_sub(1);
            }
            LockLevel::Exclusive => {
                debug_assert!(state.writer, "exclusive table lock released twice");
                state.writer = false;
            }
        }
        if state.is_free() {
            state.file_guard = None;
        }
        drop(state);
        self.released.notify_all();
    }

    /// Holders right now, as `(readers, writer)`.
    pub fn holders(&self) -> (u32, bool) {
        let state = self.state.lock();
        (state.readers, state.writer)
    }
}
