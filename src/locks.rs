//! Run locks and lock files
//!
//! At most one backup (or standalone retention sweep) runs per configuration
//! at a time. [`RunLocks`] hands out one mutex per configuration fingerprint.
//! Guards are owned and `Send`, so the scheduler can take the lock on its
//! timer task and move it into the worker thread that performs the run.
//!
//! Several processes may work on one backup location: a daemon running
//! schedules next to one-shot CLI commands. They coordinate through advisory
//! [`LockFile`]s inside the location:
//!
//! ```text
//! backup_location/
//! ├── .archivist.lock                 # shared by every open instance
//! ├── .archivist-registry.lock        # held across registry read-modify-write
//! └── .archivist-run-<fingerprint>.lock
//! ```
//!
//! The OS drops file locks when their process exits, so a crashed run never
//! leaves its configuration locked.

use crate::error::{ArchivistError, Result};
use dashmap::DashMap;
use fs2::FileExt;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{trace, warn};

/// Lock file shared by every instance that has the location open
pub const INSTANCE_LOCK_FILE: &str = ".archivist.lock";

/// Lock file guarding registry updates
pub const REGISTRY_LOCK_FILE: &str = ".archivist-registry.lock";

const RUN_LOCK_PREFIX: &str = ".archivist-run-";

/// Advisory lock on a file, shared between processes
///
/// Locks belong to the open handle: two `LockFile`s on the same path conflict
/// even inside one process.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Open `path`, creating an empty lock file if needed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for an exclusive lock
    pub fn lock_exclusive(&self) -> Result<()> {
        FileExt::lock_exclusive(&self.file).map_err(|e| self.lock_error(e))
    }

    /// Wait for a shared lock
    pub fn lock_shared(&self) -> Result<()> {
        FileExt::lock_shared(&self.file).map_err(|e| self.lock_error(e))
    }

    /// Take an exclusive lock if nobody holds the file
    ///
    /// Returns `false` when another handle holds it.
    pub fn try_lock_exclusive(&self) -> Result<bool> {
        contended(FileExt::try_lock_exclusive(&self.file)).map_err(|e| self.lock_error(e))
    }

    /// Take a shared lock unless someone holds the file exclusively
    pub fn try_lock_shared(&self) -> Result<bool> {
        contended(FileExt::try_lock_shared(&self.file)).map_err(|e| self.lock_error(e))
    }

    /// Release whatever lock this handle holds
    pub fn unlock(&self) -> Result<()> {
        FileExt::unlock(&self.file).map_err(|e| self.lock_error(e))
    }

    /// Exclusive lock released when the guard drops
    pub fn exclusive(&self) -> Result<LockFileGuard<'_>> {
        self.lock_exclusive()?;
        Ok(LockFileGuard { lock: self })
    }

    fn lock_error(&self, e: io::Error) -> ArchivistError {
        ArchivistError::internal(format!("cannot lock {:?}: {}", self.path, e))
    }
}

fn contended(result: io::Result<()>) -> io::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Held [`LockFile`] lock; released on drop
#[derive(Debug)]
pub struct LockFileGuard<'a> {
    lock: &'a LockFile,
}

impl Drop for LockFileGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            warn!("{}", e);
        }
    }
}

/// Held run lock; released on drop
pub struct RunGuard {
    key: String,
    file: Option<LockFile>,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl RunGuard {
    /// Configuration fingerprint this guard locks
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunGuard")
            .field("key", &self.key)
            .field("file", &self.file.as_ref().map(LockFile::path))
            .finish()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // The file lock goes first so a waiter in this process can take it
        // as soon as it gets the mutex
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                warn!("{}", e);
            }
        }
        trace!("Released run lock {}", self.key);
    }
}

/// Registry of run locks keyed by configuration fingerprint
///
/// Created with [`in_dir`](Self::in_dir), every lock is also backed by a lock
/// file so that runs in other processes are excluded as well.
#[derive(Debug, Default)]
pub struct RunLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    dir: Option<PathBuf>,
}

impl RunLocks {
    /// Create an empty registry local to this process
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry whose locks also hold across processes
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            locks: DashMap::new(),
            dir: Some(dir.into()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn lock_path(&self, key: &str) -> Option<PathBuf> {
        // Keys come from the registry; keep them inside `dir`
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}{}.lock", RUN_LOCK_PREFIX, name)))
    }

    /// Wait for the run lock of `key`
    ///
    /// Blocks the calling thread, including inside an async task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn acquire(&self, key: &str) -> Result<RunGuard> {
        let guard = self.lock_for(key).lock_arc();
        let file = match self.lock_path(key) {
            Some(path) => {
                let file = LockFile::open(path)?;
                file.lock_exclusive()?;
                Some(file)
            }
            None => None,
        };

        trace!("Acquired run lock {}", key);
        Ok(RunGuard {
            key: key.to_string(),
            file,
            _guard: guard,
        })
    }

    /// Take the run lock of `key` if nobody holds it
    pub fn try_acquire(&self, key: &str) -> Option<RunGuard> {
        let guard = self.lock_for(key).try_lock_arc()?;
        let file = match self.lock_path(key) {
            Some(path) => {
                let file = LockFile::open(path)
                    .and_then(|file| file.try_lock_exclusive().map(|taken| (file, taken)));
                match file {
                    Ok((file, true)) => Some(file),
                    Ok((_, false)) => {
                        trace!("Run lock {} is held by another process", key);
                        return None;
                    }
                    Err(e) => {
                        warn!("Run lock {} unavailable: {}", key, e);
                        return None;
                    }
                }
            }
            None => None,
        };

        trace!("Acquired run lock {}", key);
        Some(RunGuard {
            key: key.to_string(),
            file,
            _guard: guard,
        })
    }

    /// Check whether a run, here or in another process, holds the lock of `key`
    pub fn is_running(&self, key: &str) -> bool {
        if self.locks.get(key).is_some_and(|lock| lock.is_locked()) {
            return true;
        }
        let Some(path) = self.lock_path(key).filter(|p| p.exists()) else {
            return false;
        };

        let probe = LockFile::open(path).and_then(|file| {
            let free = file.try_lock_shared()?;
            if free {
                file.unlock()?;
            }
            Ok(!free)
        });
        match probe {
            Ok(running) => running,
            Err(e) => {
                warn!("Cannot check run lock {}: {}", key, e);
                false
            }
        }
    }
}
