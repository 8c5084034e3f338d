//! Cross-process advisory file locking.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// An advisory lock on a sentinel file, held for the lifetime of the guard.
///
/// The lock is released when the guard drops, on every exit path including
/// failure. On Unix this is `flock(2)`; elsewhere the sentinel file is
/// created but provides no exclusion (best effort, matching the installer's
/// contract of converging rather than strictly serializing).
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the lock on `path` is held.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}
