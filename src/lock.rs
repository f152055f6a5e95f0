// ABOUTME: Single-run lock file so two sync passes never overlap on one store
// ABOUTME: Ownership is an OS advisory lock; the file body only records who holds it

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::sync::clock::Timestamp;

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    /// Name of the job holding the lock
    pub job: String,
    pub acquired_at: Timestamp,
}

/// Take an exclusive, non-blocking advisory lock on `file`.
///
/// Returns `Ok(false)` when another open file description holds it. The OS
/// drops the lock when the holder closes the file or dies.
#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct SyncLock {
    path: PathBuf,
    info: LockInfo,
    #[cfg(unix)]
    file: File,
}

impl SyncLock {
    /// Try to take the lock at `path`.
    ///
    /// Returns `Ok(None)` when another pass holds it. A lock left behind by a
    /// dead process is free again because the OS released it.
    pub fn acquire(path: impl AsRef<Path>, job: &str) -> Result<Option<Self>> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create lock directory {:?}", parent))?;
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            job: job.to_string(),
            acquired_at: chrono::Utc::now(),
        };
        Self::lock(path, info)
    }

    #[cfg(unix)]
    fn lock(path: &Path, info: LockInfo) -> Result<Option<Self>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {:?}", path))?;

        if !try_lock(&file).with_context(|| format!("Failed to lock {:?}", path))? {
            tracing::debug!("Lock {:?} is held by another process", path);
            return Ok(None);
        }

        // Only the holder writes, so the body never races another writer
        let contents = serde_json::to_string(&info).context("Failed to serialize lock info")?;
        file.set_len(0)
            .and_then(|_| file.write_all(contents.as_bytes()))
            .and_then(|_| file.flush())
            .with_context(|| format!("Failed to write lock file {:?}", path))?;

        Ok(Some(Self {
            path: path.to_path_buf(),
            info,
            file,
        }))
    }

    /// Without advisory locks, install the fully written body with a hard
    /// link, which fails if the lock file already exists.
    #[cfg(not(unix))]
    fn lock(path: &Path, info: LockInfo) -> Result<Option<Self>> {
        let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        let contents = serde_json::to_string(&info).context("Failed to serialize lock info")?;
        fs::write(&tmp_path, contents)
            .with_context(|| format!("Failed to write lock file {:?}", tmp_path))?;

        let linked = fs::hard_link(&tmp_path, path);
        let _ = fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => Ok(Some(Self {
                path: path.to_path_buf(),
                info,
            })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to create lock file {:?}", path)),
        }
    }

    /// Who holds the lock at `path`, if anyone.
    ///
    /// A file nobody holds (for instance left by a crashed pass) reports `None`.
    /// A pass starting during this check sees the lock as held and skips.
    pub fn holder(path: impl AsRef<Path>) -> Result<Option<LockInfo>> {
        let path = path.as_ref();
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to open lock {:?}", path)),
        };

        // Briefly taking the lock proves nobody holds it; closing the file
        // gives it back
        #[cfg(unix)]
        if try_lock(&file).with_context(|| format!("Failed to check lock {:?}", path))? {
            return Ok(None);
        }

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .with_context(|| format!("Failed to read lock {:?}", path))?;
        let info = serde_json::from_str(&contents)
            .with_context(|| format!("Lock {:?} is held but its owner is not recorded yet", path))?;
        Ok(Some(info))
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SyncLock {
    #[cfg(unix)]
    fn drop(&mut self) {
        // The file stays in place; unlinking it would let a newcomer lock a
        // fresh inode while someone else still waits on the old one
        if let Err(e) = self.file.set_len(0) {
            tracing::warn!("Failed to clear lock {:?}: {}", self.path, e);
        }
    }

    #[cfg(not(unix))]
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!("Failed to release lock {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locks").join("sync.lock");

        let lock = SyncLock::acquire(&path, "articles").unwrap().unwrap();
        assert_eq!(lock.info().pid, std::process::id());
        let holder = SyncLock::holder(&path).unwrap().unwrap();
        assert_eq!(holder.job, "articles");

        drop(lock);
        assert_eq!(SyncLock::holder(&path).unwrap(), None);
        assert!(SyncLock::acquire(&path, "articles").unwrap().is_some());
    }

    #[test]
    fn test_second_acquire_is_refused_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.lock");

        let _lock = SyncLock::acquire(&path, "articles").unwrap().unwrap();
        assert!(SyncLock::acquire(&path, "articles").unwrap().is_none());
        assert_eq!(SyncLock::holder(&path).unwrap().unwrap().job, "articles");
    }

    #[cfg(unix)]
    #[test]
    fn test_held_lock_with_unwritten_body_is_not_taken() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.lock");

        // A holder that has locked the file but not written its record yet
        let mid_write = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        assert!(try_lock(&mid_write).unwrap());

        assert!(SyncLock::acquire(&path, "articles").unwrap().is_none());
        assert!(SyncLock::holder(&path).is_err());

        drop(mid_write);
        assert!(SyncLock::acquire(&path, "articles").unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_leftover_file_from_dead_holder_is_free() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.lock");
        let stale = LockInfo {
            pid: i32::MAX as u32,
            job: "articles".to_string(),
            acquired_at: chrono::Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        assert_eq!(SyncLock::holder(&path).unwrap(), None);
        let lock = SyncLock::acquire(&path, "articles").unwrap().unwrap();
        assert_eq!(lock.info().pid, std::process::id());
        assert_eq!(
            SyncLock::holder(&path).unwrap().unwrap().pid,
            std::process::id()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_empty_unheld_file_is_free() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.lock");
        fs::write(&path, "").unwrap();

        assert!(SyncLock::acquire(&path, "articles").unwrap().is_some());
    }
}
