//! Advisory lock on the incoming area
//!
//! Overlapping invocations serialize their scan of the incoming directory
//! through an exclusive `flock` on a lock file inside it. The lock is held
//! until the [`IncomingLock`] drops.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for the incoming lock")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct IncomingLock {
    lock_path: PathBuf,
    lock_file: File,
}

impl IncomingLock {
    pub const LOCK_FILENAME: &'static str = ".dbflow.lock";

    /// Lock `incoming_dir`, creating it if needed. Waits up to `timeout`.
    pub fn acquire(incoming_dir: &Path, timeout: Duration) -> LockResult<Self> {
        fs::create_dir_all(incoming_dir)?;

        let lock_path = incoming_dir.join(Self::LOCK_FILENAME);
        let start = Instant::now();
        let poll_interval = Duration::from_millis(50);
        let mut warned = false;

        loop {
            match Self::try_acquire_exclusive(&lock_path) {
                Ok(file) => {
                    if warned {
                        tracing::info!(
                            waited_secs = start.elapsed().as_secs_f64(),
                            path = %lock_path.display(),
                            "incoming lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path,
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        tracing::warn!(path = %lock_path.display(), "incoming area locked, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }
            std::thread::sleep(poll_interval);
        }
    }

    #[cfg(unix)]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(lock_path)?;

        // SAFETY: fd is a valid open descriptor owned by `file`
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(file);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        } else {
            Err(err)
        }
    }

    #[cfg(not(unix))]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for IncomingLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is still owned by `lock_file`
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
