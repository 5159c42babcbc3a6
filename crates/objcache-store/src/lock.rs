//! Cache-wide advisory locking
//!
//! One lock file guards the whole cache root. Two modes are offered:
//! - `Read`: shared, any number of concurrent holders
//! - `ReadWrite`: exclusive, excludes every `Read` holder
//!
//! There is no in-place upgrade. A holder that needs to write drops its
//! `Read` lock and acquires `ReadWrite` separately, so two validators of the
//! same key can both observe a miss and both go on to write. Writers replace
//! whole entries, so the last writer wins.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("{mode} lock timeout after {timeout:?}")]
    Timeout { mode: LockMode, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock, many concurrent holders.
    Read,
    /// Exclusive lock, one holder.
    ReadWrite,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Advisory lock on a cache directory.
///
/// The lock is released when this struct is dropped.
#[derive(Debug)]
pub struct CacheLock {
    lock_path: PathBuf,
    mode: LockMode,
    lock_file: File,
}

impl CacheLock {
    /// Lock file name
    pub const LOCK_FILENAME: &'static str = ".objcache.lock";

    /// Acquire a lock on the given cache directory.
    ///
    /// Creates the directory and lock file if they don't exist.
    /// Waits up to `timeout` for the lock to become available.
    pub fn acquire(cache_dir: &Path, mode: LockMode, timeout: Duration) -> LockResult<Self> {
        fs::create_dir_all(cache_dir)?;

        let lock_path = cache_dir.join(Self::LOCK_FILENAME);
        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);
        let mut warned = false;

        loop {
            match Self::try_acquire(&lock_path, mode) {
                Ok(file) => {
                    if warned {
                        warn!(
                            path = %lock_path.display(),
                            %mode,
                            waited_ms = start.elapsed().as_millis() as u64,
                            "lock acquired after contention"
                        );
                    } else {
                        debug!(path = %lock_path.display(), %mode, "lock acquired");
                    }
                    return Ok(Self {
                        lock_path,
                        mode,
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        warn!(path = %lock_path.display(), %mode, "lock contention, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout { mode, timeout });
            }

            std::thread::sleep(poll_interval);
        }
    }

    #[cfg(unix)]
    fn try_acquire(lock_path: &Path, mode: LockMode) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        // No truncate: other holders share this file.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(lock_path)?;

        let operation = match mode {
            LockMode::Read => libc::LOCK_SH,
            LockMode::ReadWrite => libc::LOCK_EX,
        };

        let result = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };

        if result == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    /// Non-unix fallback: both modes become an exclusive create-new lock file.
    #[cfg(not(unix))]
    fn try_acquire(lock_path: &Path, _mode: LockMode) -> io::Result<File> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    /// Get the lock file path.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Mode this lock was acquired in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
        debug!(path = %self.lock_path.display(), mode = %self.mode, "lock released");
    }
}
