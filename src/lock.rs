//! Advisory lock on the base directory so only one process writes the
//! vector store and the galaxy cache.
//!
//! - Daemon: acquires the lock on startup, holds it for its lifetime
//! - CLI: acquires it for commands that write (`import`, `build`)

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE_NAME: &str = "galaxy.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{0} is locked by another galaxy process (daemon or CLI)")]
    Locked(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A held directory lock that releases on drop
pub struct DirLock {
    file: File,
}

impl DirLock {
    /// Acquire the lock without blocking.
    pub fn try_acquire(base_path: &Path) -> Result<Self, LockError> {
        let lock_path = base_path.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if !try_lock_exclusive(&file)? {
            return Err(LockError::Locked(base_path.to_path_buf()));
        }

        log::debug!("acquired {}", lock_path.display());
        Ok(DirLock { file })
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EWOULDBLOCK)
            || err.raw_os_error() == Some(libc::EAGAIN)
        {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    // no advisory locking outside unix
    Ok(true)
}

#[cfg(unix)]
impl Drop for DirLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // ignore errors on drop
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}
