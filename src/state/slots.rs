//! Per-task concurrency slots shared by every swarm process on the host.
//!
//! A task limited to `n` concurrent runs owns lock files
//! `<dir>/<task>.<slot>.lock` for slots `0..n`. Holding an exclusive lock on
//! any one of them is holding a slot. The kernel drops the lock when the
//! holder exits, so a crashed process never leaks a slot.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::util::blocking;
use crate::Result;

/// How often a waiter re-checks for a free slot.
pub const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TaskSlots {
    dir: PathBuf,
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    file: File,
    path: PathBuf,
    slot: u32,
}

impl SlotGuard {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TaskSlots {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn slot_path(&self, task: &str, slot: u32) -> PathBuf {
        self.dir.join(format!("{}.{}.lock", task, slot))
    }

    /// Take the first free slot of `task` without waiting.
    ///
    /// `limit == 0` means unlimited and returns `None` without touching the
    /// filesystem, as does a limit whose slots are all held.
    pub fn try_acquire(&self, task: &str, limit: u32) -> Result<Option<SlotGuard>> {
        if limit == 0 {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.dir)?;
        for slot in 0..limit {
            let path = self.slot_path(task, slot);
            if let Some(file) = lock_exclusive(&path)? {
                return Ok(Some(SlotGuard { file, path, slot }));
            }
        }
        Ok(None)
    }

    /// Wait until a slot of `task` is free and take it.
    ///
    /// Returns `Ok(None)` for an unlimited task or when `cancel` fires first.
    pub async fn acquire(
        &self,
        task: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<SlotGuard>> {
        if limit == 0 {
            return Ok(None);
        }
        loop {
            let slots = self.clone();
            let name = task.to_string();
            if let Some(guard) = blocking(move || slots.try_acquire(&name, limit)).await? {
                debug!(task, slot = guard.slot, "concurrency slot acquired");
                return Ok(Some(guard));
            }
            tokio::select! {
                _ = tokio::time::sleep(SLOT_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(path: &Path) -> Result<Option<File>> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(Some(file));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(None)
    } else {
        Err(err.into())
    }
}

#[cfg(unix)]
impl Drop for SlotGuard {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        // The file stays; removing it would let a late opener lock a fresh inode.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(path: &Path) -> Result<Option<File>> {
    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
