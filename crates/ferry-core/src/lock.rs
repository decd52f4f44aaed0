use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Advisory lock errors for the mapping directory.
#[derive(Debug)]
pub enum LockError {
    Timeout { path: PathBuf, waited: Duration },
    IoError(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::IoError(_) => ErrorCode::MappingFileIo,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { path, waited } => write!(
                f,
                "mapping directory lock {} still held after {waited:?}",
                path.display()
            ),
            Self::IoError(err) => write!(f, "mapping directory lock failed: {err}"),
        }
    }
}

impl std::error::Error for LockError {}

/// RAII guard holding an exclusive advisory lock on a mapping directory.
///
/// Two ferry processes pointed at the same `mappings_dir` would otherwise
/// race their flushes and keep whichever table was written last.
#[derive(Debug)]
pub struct MappingDirLock {
    file: File,
    path: PathBuf,
}

impl MappingDirLock {
    /// Acquire the lock file at `path`, polling until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if another process keeps the lock, or
    /// [`LockError::IoError`] if the lock file cannot be created.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "lock path has no parent")
        })?;
        fs::create_dir_all(parent)?;

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?;

            if file.try_lock_exclusive().is_ok() {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MappingDirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
