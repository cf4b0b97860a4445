//! Advisory byte-range locks for `LockMode::Process` tables.
//!
//! Each table keeps a dedicated `.lck` file. Byte 0 guards the transaction
//! level table lock and byte 1 the per-operation storage lock. POSIX record
//! locks belong to the process and are dropped when *any* descriptor of the
//! file closes, so the lock file is opened once per table and never shared
//! with the data mapping.
//!
//! Record locks do not exclude threads of the same process; in-process
//! exclusion still comes from the table's `RwLock`s.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};

/// Byte guarding the transaction-level table lock.
pub const TABLE_LOCK_BYTE: u64 = 0;
/// Byte guarding the per-operation storage lock.
pub const STORAGE_LOCK_BYTE: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeLockKind {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Arc<File>,
}

impl LockFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open lock file '{}'", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the byte at `offset` is locked in the requested mode.
    pub fn lock(&self, offset: u64, kind: RangeLockKind) -> Result<RangeLockGuard> {
        set_lock(&self.file, lock_type(kind), offset, true)
            .wrap_err_with(|| format!("failed to lock byte {} of '{}'", offset, self.path.display()))?;
        Ok(RangeLockGuard {
            file: Arc::clone(&self.file),
            offset,
            kind,
        })
    }
}

fn lock_type(kind: RangeLockKind) -> libc::c_int {
    match kind {
        RangeLockKind::Shared => libc::F_RDLCK,
        RangeLockKind::Exclusive => libc::F_WRLCK,
    }
}

/// Releases its byte range on drop.
#[derive(Debug)]
pub struct RangeLockGuard {
    file: Arc<File>,
    offset: u64,
    kind: RangeLockKind,
}

impl RangeLockGuard {
    pub fn kind(&self) -> RangeLockKind {
        self.kind
    }

    /// Switches the held byte to `kind` in place. The byte is never
    /// unlocked in between.
    pub fn convert(&mut self, kind: RangeLockKind) -> Result<()> {
        if kind != self.kind {
            set_lock(&self.file, lock_type(kind), self.offset, true)
                .wrap_err_with(|| format!("failed to convert lock on byte {}", self.offset))?;
            self.kind = kind;
        }
        Ok(())
    }
}

impl Drop for RangeLockGuard {
    fn drop(&mut self) {
        if let Err(e) = set_lock(&self.file, libc::F_UNLCK, self.offset, false) {
            tracing::warn!(offset = self.offset, error = %e, "failed to release file range lock");
        }
    }
}

#[cfg(unix)]
fn set_lock(file: &File, lock_type: libc::c_int, offset: u64, wait: bool) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: flock is a plain C struct; all-zero is a valid value and the
    // fields we rely on are set below. Zeroing covers platform-specific
    // trailing fields.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = offset as libc::off_t;
    fl.l_len = 1;

    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        // SAFETY: the descriptor is owned by `file`, which outlives the call,
        // and `fl` is a valid flock for the duration of the call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl as *const libc::flock) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn set_lock(_file: &File, _lock_type: libc::c_int, _offset: u64, _wait: bool) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process lock mode requires POSIX record locks",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_and_release_both_bytes() {
        let dir = tempdir().unwrap();
        let lock = LockFile::open(dir.path().join("t.lck")).unwrap();

        let table = lock.lock(TABLE_LOCK_BYTE, RangeLockKind::Exclusive).unwrap();
        let storage = lock.lock(STORAGE_LOCK_BYTE, RangeLockKind::Shared).unwrap();
        drop(storage);
        drop(table);

        // Re-acquiring after release must not block.
        let _again = lock.lock(TABLE_LOCK_BYTE, RangeLockKind::Exclusive).unwrap();
    }

    #[test]
    fn same_process_relock_converts() {
        let dir = tempdir().unwrap();
        let lock = LockFile::open(dir.path().join("t.lck")).unwrap();
        let _shared = lock.lock(TABLE_LOCK_BYTE, RangeLockKind::Shared).unwrap();
        let _exclusive = lock.lock(TABLE_LOCK_BYTE, RangeLockKind::Exclusive).unwrap();
    }

    #[test]
    fn guard_converts_in_place() {
        let dir = tempdir().unwrap();
        let lock = LockFile::open(dir.path().join("t.lck")).unwrap();
        let mut guard = lock.lock(STORAGE_LOCK_BYTE, RangeLockKind::Shared).unwrap();
        guard.convert(RangeLockKind::Exclusive).unwrap();
        assert_eq!(guard.kind(), RangeLockKind::Exclusive);
        guard.convert(RangeLockKind::Exclusive).unwrap();
        assert_eq!(guard.kind(), RangeLockKind::Exclusive);
    }
}
