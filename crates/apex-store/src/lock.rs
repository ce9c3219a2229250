//! Advisory writer lock for the runtime database.
//!
//! A single `flock`-style exclusive lock on `runtime.db.lock` guards the one
//! process allowed to write the runtime store. The holder's PID is written
//! into the lock file so diagnostics can distinguish a live holder from a
//! crashed one.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, StoreError};

/// Observed state of the runtime writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No lock file, or a cleanly released lock.
    Free,
    /// Lock file present and the recorded PID is alive.
    Held(u32),
    /// Lock file present but the recorded PID is dead.
    Stale(u32),
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::Free => write!(f, "FREE"),
            LockState::Held(pid) => write!(f, "HELD({pid})"),
            LockState::Stale(pid) => write!(f, "STALE({pid})"),
        }
    }
}

/// Exclusive advisory lock on the runtime DB. Released (and the lock file
/// removed) on drop.
#[derive(Debug)]
pub struct RuntimeLock {
    file: File,
    path: PathBuf,
}

impl RuntimeLock {
    /// Acquire the writer lock, writing our PID into the lock file.
    ///
    /// Fails with [`StoreError::LockHeld`] if another live process holds it.
    /// A stale lock (dead PID) is silently taken over.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            let pid = read_pid(&mut file).unwrap_or(0);
            return Err(StoreError::LockHeld { pid });
        }

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self { file, path })
    }

    /// Inspect the lock without acquiring it.
    pub fn state(path: impl AsRef<Path>) -> LockState {
        let path = path.as_ref();
        if !path.exists() {
            return LockState::Free;
        }
        let pid = match File::open(path).ok().and_then(|mut f| read_pid(&mut f)) {
            Some(pid) if pid > 0 => pid,
            _ => return LockState::Free,
        };
        if pid_alive(pid) {
            LockState::Held(pid)
        } else {
            LockState::Stale(pid)
        }
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut buf = String::new();
    file.read_to_string(&mut buf).ok()?;
    buf.trim().parse().ok()
}

/// Dead-PID probe. On Linux a live process has a `/proc/<pid>` entry; on
/// other platforms we conservatively report the holder as alive.
fn pid_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{pid}")).exists()
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.db.lock");
        let _lock = RuntimeLock::acquire(&path).unwrap();

        let state = RuntimeLock::state(&path);
        assert_eq!(state, LockState::Held(std::process::id()));
    }

    #[test]
    fn released_lock_reports_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.db.lock");
        {
            let _lock = RuntimeLock::acquire(&path).unwrap();
        }
        assert_eq!(RuntimeLock::state(&path), LockState::Free);
    }

    #[test]
    fn missing_file_reports_free() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            RuntimeLock::state(dir.path().join("nope.lock")),
            LockState::Free
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dead_pid_reports_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.db.lock");
        // PIDs near the u32 ceiling are far beyond pid_max.
        fs::write(&path, "4294967294").unwrap();
        assert_eq!(RuntimeLock::state(&path), LockState::Stale(4_294_967_294));
    }

    #[test]
    fn state_probe_does_not_block_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.db.lock");
        let _lock = RuntimeLock::acquire(&path).unwrap();
        assert!(matches!(RuntimeLock::state(&path), LockState::Held(_)));
    }
}
