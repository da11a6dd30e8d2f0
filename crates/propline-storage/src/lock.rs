use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock at {path} ({holder})")]
    Held { path: PathBuf, holder: String },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive run lock backed by a file created with `create_new`.
///
/// Acquisition never waits. The file is removed when the guard is dropped,
/// so every exit path releases it.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

impl RunLock {
    /// Take the lock at `path`. A lock file older than `stale_after` is
    /// treated as abandoned and reclaimed once.
    pub fn acquire(path: impl AsRef<Path>, stale_after: Option<Duration>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(LockError::Held { holder, .. }) if is_stale(&path, stale_after) => {
                warn!(path = %path.display(), %holder, "reclaiming stale run lock");
                fs::remove_file(&path).map_err(|source| LockError::Io {
                    path: path.clone(),
                    source,
                })?;
                Self::create(&path)
            }
            Err(err) => Err(err),
        }
    }

    fn create(path: &Path) -> Result<Self, LockError> {
        Self::create_with(path, write_stamp)
    }

    fn create_with(
        path: &Path,
        stamp: impl FnOnce(&mut File) -> io::Result<()>,
    ) -> Result<Self, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                if let Err(source) = stamp(&mut file) {
                    // an unstamped file would block every later run
                    drop(file);
                    let _ = fs::remove_file(path);
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
                info!(path = %path.display(), "run lock acquired");
                Ok(Self {
                    path: path.to_path_buf(),
                    released: false,
                })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".to_string());
                Err(LockError::Held {
                    path: path.to_path_buf(),
                    holder,
                })
            }
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn write_stamp(file: &mut File) -> io::Result<()> {
    let stamp = format!("pid={} acquired_at={}\n", std::process::id(), Utc::now().to_rfc3339());
    file.write_all(stamp.as_bytes())?;
    file.flush()
}

fn is_stale(path: &Path, stale_after: Option<Duration>) -> bool {
    let Some(stale_after) = stale_after else {
        return false;
    };
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}
