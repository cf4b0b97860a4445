//! Runtime options recognised by databases and tables.
//!
//! | Option | Values | Default |
//! |--------|--------|---------|
//! | lock mode | `thread`, `process`, `nolock` | `thread` |
//! | WAL sync mode | `off`, `N` (every N commits), `commit` | `commit` |
//! | initial arena capacity | slots, rounded up to a power of two | 8 |
//! | WAL switch threshold | bytes | 256 MiB |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use eyre::{bail, Result};

use super::constants::{DEFAULT_ARENA_CAPACITY, DEFAULT_WAL_SWITCH_THRESHOLD};

/// How table-level and storage-level locks are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// In-process reader-writer locks.
    #[default]
    Thread,
    /// Advisory file-range locks, shared by every process mapping the table.
    Process,
    /// Writers are not serialized at the transaction level.
    NoLock,
}

impl FromStr for LockMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "thread" => Ok(LockMode::Thread),
            "process" => Ok(LockMode::Process),
            "nolock" | "none" => Ok(LockMode::NoLock),
            other => bail!("unknown lock mode '{}'", other),
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::Thread => "thread",
            LockMode::Process => "process",
            LockMode::NoLock => "nolock",
        };
        f.write_str(name)
    }
}

/// When appended WAL bytes are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Never block on the WAL; the OS writes pages back on its own.
    Off,
    /// Flush asynchronously, blocking once every `n` commits.
    EveryN(u32),
    /// Block until each commit's bytes are durable.
    #[default]
    EveryCommit,
}

impl SyncMode {
    /// Commits allowed between blocking syncs, or `None` when syncing is off.
    pub fn interval(self) -> Option<u64> {
        match self {
            SyncMode::Off => None,
            SyncMode::EveryN(0) | SyncMode::EveryCommit => Some(1),
            SyncMode::EveryN(n) => Some(n as u64),
        }
    }
}

impl FromStr for SyncMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(SyncMode::Off),
            "commit" | "full" | "1" => Ok(SyncMode::EveryCommit),
            other => match other.parse::<u32>() {
                Ok(n) => Ok(SyncMode::EveryN(n)),
                Err(_) => bail!("unknown WAL sync mode '{}'", other),
            },
        }
    }
}

/// Per-database defaults.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub lock_mode: LockMode,
    pub sync_mode: SyncMode,
    pub initial_capacity: u32,
    pub wal_switch_threshold: u64,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::default(),
            sync_mode: SyncMode::default(),
            initial_capacity: DEFAULT_ARENA_CAPACITY,
            wal_switch_threshold: DEFAULT_WAL_SWITCH_THRESHOLD,
        }
    }
}

impl DatabaseOptions {
    /// Initial capacity rounded to the power of two the arenas start with.
    pub fn arena_capacity(&self) -> u32 {
        normalize_capacity(self.initial_capacity)
    }
}

/// Per-table overrides. Unset fields inherit from [`DatabaseOptions`].
#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    pub lock_mode: Option<LockMode>,
    pub in_memory: bool,
    pub initial_capacity: Option<u32>,
}

/// Engine-wide options.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Period of the background flusher. `None` disables it.
    pub flush_interval: Option<Duration>,
}

pub(crate) fn normalize_capacity(requested: u32) -> u32 {
    requested
        .max(DEFAULT_ARENA_CAPACITY)
        .checked_next_power_of_two()
        .unwrap_or(1 << 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_mode_parses_case_insensitively() {
        assert_eq!("Thread".parse::<LockMode>().unwrap(), LockMode::Thread);
        assert_eq!("PROCESS".parse::<LockMode>().unwrap(), LockMode::Process);
        assert_eq!("nolock".parse::<LockMode>().unwrap(), LockMode::NoLock);
        assert!("table".parse::<LockMode>().is_err());
    }

    #[test]
    fn sync_mode_parses_counts() {
        assert_eq!("off".parse::<SyncMode>().unwrap(), SyncMode::Off);
        assert_eq!("commit".parse::<SyncMode>().unwrap(), SyncMode::EveryCommit);
        assert_eq!("16".parse::<SyncMode>().unwrap(), SyncMode::EveryN(16));
        assert!("sometimes".parse::<SyncMode>().is_err());
    }

    #[test]
    fn sync_interval() {
        assert_eq!(SyncMode::Off.interval(), None);
        assert_eq!(SyncMode::EveryCommit.interval(), Some(1));
        assert_eq!(SyncMode::EveryN(0).interval(), Some(1));
        assert_eq!(SyncMode::EveryN(4).interval(), Some(4));
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        assert_eq!(normalize_capacity(0), 8);
        assert_eq!(normalize_capacity(9), 16);
        assert_eq!(normalize_capacity(1024), 1024);
    }
}
