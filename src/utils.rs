//! Utility functions for archivist
//!
//! Small filesystem and path helpers shared by the collector, the archive
//! writer, the metadata store and the restore engine.
//!
//! ## Categories of Utilities
//!
//! ### File Operations
//! - Atomic file writing (staged temp file + rename)
//! - Permission handling (cross-platform)
//! - Idempotent removal
//!
//! ### Path Manipulation
//! - Converting relative paths to archive entry names
//! - Validating entry names read back from an artifact
//! - Validating backup identifiers
//!
//! ## Thread Safety
//!
//! All utility functions are thread-safe and can be called concurrently from
//! multiple threads without synchronization.

use crate::error::{ArchivistError, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Prefix of every staging file created next to its final destination
pub const STAGING_PREFIX: &str = ".archivist-staging-";

/// Maximum length of a backup identifier
const MAX_BACKUP_ID_LEN: usize = 128;

/// Atomic file write (write to temp file then rename)
///
/// Writes `content` to a uniquely named temporary file in the same directory
/// as `path`, flushes it to disk and renames it over `path`. Readers either
/// see the old file or the complete new one.
///
/// # Errors
///
/// - [`ArchivistError::Io`] if the temporary file cannot be written
/// - [`ArchivistError::Io`] if the rename fails
///
/// # Example
///
/// ```rust,ignore
/// use crate::utils::atomic_write;
/// use std::path::Path;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// atomic_write(Path::new("backup_registry.json"), b"{}")?;
/// # Ok(())
/// # }
/// ```
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    let mut staged = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)?;

    staged.write_all(content)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| ArchivistError::Io(e.error))?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Directory a sibling temp file of `path` should live in
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Remove a file, treating "already gone" as success
///
/// Returns `true` if a file was removed.
pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove staging files left in `dir` by an interrupted writer
///
/// Only call this while holding the location's instance lock exclusively,
/// so that no writer can be active in `dir`.
pub fn remove_stale_staging(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            continue;
        }
        if entry.file_type()?.is_file() && remove_file_if_exists(&entry.path())? {
            trace!("Removed stale staging file {:?}", entry.path());
            removed.push(entry.path());
        }
    }
    Ok(removed)
}

/// Convert a relative path to its archive entry name
///
/// Components are joined with `/` on every platform so that entry names, and
/// therefore checksums, do not depend on the host's path separator.
pub fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate an entry name read from an artifact and turn it into a relative path
///
/// Rejects empty names, absolute paths and any `..` component so extraction
/// can never escape the target directory.
pub fn sanitize_entry_path(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let mut clean = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchivistError::restore(format!(
                    "Unsafe entry path in archive: {:?}",
                    name
                )));
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(ArchivistError::restore(format!(
            "Empty entry path in archive: {:?}",
            name
        )));
    }
    Ok(clean)
}

/// Check whether a string is usable as a backup identifier
///
/// Identifiers become file names, so only ASCII letters, digits, `-`, `_` and
/// `.` are allowed, and the first character may not be `.`.
pub fn is_valid_backup_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_BACKUP_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Check whether a file name is hidden (dotfile)
pub fn is_hidden_name(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Get Unix permissions from metadata
#[cfg(unix)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Get permissions from metadata (Windows implementation)
#[cfg(windows)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set permissions (Windows implementation)
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Format bytes in human-readable form
///
/// Uses 1024 as the conversion factor.
///
/// ```rust,ignore
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
