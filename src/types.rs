//! Core data types used throughout the archivist library
//!
//! This module contains the data structures shared by the collector, the
//! archive layer, the metadata store and the orchestrator.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **File selection**: `FileEntry`, `Manifest`, `SkippedFile` - what a run archives and what it left out
//! - **Records**: `BackupRecord`, `BackupStatus`, `CompressionType` - the persisted result of a run
//! - **Operations**: `RestoreResult`, `SweepReport`, `StoreStats` - results of restore, retention and stats
//! - **Options**: `BackupOptions`, `RestoreOptions` - per-call parameters (cancellation, progress)
//!
//! ## Examples
//!
//! ```rust
//! use archivist::types::{BackupStatus, CompressionType};
//!
//! assert_eq!(CompressionType::TarGz.extension(), "tar.gz");
//! assert!(BackupStatus::Completed.can_transition_to(BackupStatus::Corrupted));
//! assert!(!BackupStatus::Failed.can_transition_to(BackupStatus::Completed));
//! ```

use crate::config::BackupConfiguration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Container format of a backup artifact
///
/// `None` still produces a single container (an uncompressed tar stream) so
/// that writing, verification and restore handle every format the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CompressionType {
    /// Uncompressed tar container
    #[serde(rename = "none")]
    None,
    /// Zip archive with deflate
    #[serde(rename = "zip")]
    Zip,
    /// Plain tar archive
    #[serde(rename = "tar")]
    Tar,
    /// Gzip-compressed tar archive
    #[default]
    #[serde(rename = "tar.gz")]
    TarGz,
    /// Bzip2-compressed tar archive
    #[serde(rename = "tar.bz2")]
    TarBz2,
}

impl CompressionType {
    /// Every supported format
    pub const ALL: [CompressionType; 5] = [
        CompressionType::None,
        CompressionType::Zip,
        CompressionType::Tar,
        CompressionType::TarGz,
        CompressionType::TarBz2,
    ];

    /// Configuration name of the format
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Zip => "zip",
            CompressionType::Tar => "tar",
            CompressionType::TarGz => "tar.gz",
            CompressionType::TarBz2 => "tar.bz2",
        }
    }

    /// File extension used for artifacts of this format
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None | CompressionType::Tar => "tar",
            CompressionType::Zip => "zip",
            CompressionType::TarGz => "tar.gz",
            CompressionType::TarBz2 => "tar.bz2",
        }
    }

    /// Whether the container is a tar stream
    pub fn is_tar(&self) -> bool {
        !matches!(self, CompressionType::Zip)
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "zip" => Ok(CompressionType::Zip),
            "tar" => Ok(CompressionType::Tar),
            "tar.gz" | "tgz" | "gztar" => Ok(CompressionType::TarGz),
            "tar.bz2" | "tbz2" | "bztar" => Ok(CompressionType::TarBz2),
            other => Err(format!(
                "unknown compression type '{}' (expected none, zip, tar, tar.gz or tar.bz2)",
                other
            )),
        }
    }
}

/// Lifecycle status of a backup record
///
/// Transitions are monotonic:
///
/// ```text
/// pending ──▶ in_progress ──▶ completed ──▶ corrupted
///    │              │
///    └──────────────┴──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Record created, nothing done yet
    Pending,
    /// Collection, hashing or writing underway
    InProgress,
    /// Artifact written and verified
    Completed,
    /// Run aborted; `error_message` says why
    Failed,
    /// A later verification of a completed artifact failed
    Corrupted,
}

impl BackupStatus {
    /// Check whether moving from `self` to `next` keeps the lifecycle monotonic
    pub fn can_transition_to(self, next: BackupStatus) -> bool {
        use BackupStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Completed, Corrupted)
        )
    }

    /// Whether a run with this status is still underway
    pub fn is_active(self) -> bool {
        matches!(self, BackupStatus::Pending | BackupStatus::InProgress)
    }

    /// Whether this status carries an error message
    pub fn is_error(self) -> bool {
        matches!(self, BackupStatus::Failed | BackupStatus::Corrupted)
    }

    /// Name as stored in the registry
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Corrupted => "corrupted",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file selected for backup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute path on disk
    pub path: PathBuf,
    /// Path relative to the archive root (`<source label>/<path inside source>`)
    pub relative_path: PathBuf,
    /// Entry name inside the artifact, `/`-separated
    pub archive_name: String,
    /// File size in bytes at collection time
    pub size: u64,
    /// Unix file permissions
    pub permissions: u32,
    /// Last modified timestamp
    pub modified: DateTime<Utc>,
}

/// Sorted list of files selected for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Entries sorted by `archive_name`
    pub entries: Vec<FileEntry>,
    /// Sum of entry sizes
    pub total_size: u64,
}

impl Manifest {
    /// Build a manifest, sorting entries into canonical order
    pub fn new(mut entries: Vec<FileEntry>) -> Self {
        entries.sort_by(|a, b| a.archive_name.cmp(&b.archive_name));
        let total_size = entries.iter().map(|e| e.size).sum();
        Self { entries, total_size }
    }

    /// Number of files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was selected
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in canonical order
    pub fn iter(&self) -> std::slice::Iter<'_, FileEntry> {
        self.entries.iter()
    }
}

/// Why a file was left out of a run or a restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Larger than `max_file_size_bytes`
    TooLarge {
        /// Actual size
        size: u64,
        /// Configured ceiling
        limit: u64,
    },
    /// Could not be opened or stat'ed
    Unreadable {
        /// Underlying error
        message: String,
    },
    /// Symlink, socket, device or other non-regular file
    NotRegularFile,
    /// Restore target already exists and overwriting was not allowed
    AlreadyExists,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooLarge { size, limit } => {
                write!(f, "file too large ({} bytes, limit {} bytes)", size, limit)
            }
            SkipReason::Unreadable { message } => write!(f, "unreadable: {}", message),
            SkipReason::NotRegularFile => f.write_str("not a regular file"),
            SkipReason::AlreadyExists => f.write_str("target exists"),
        }
    }
}

/// A `(path, reason)` pair accumulated instead of failing the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    /// Path that was skipped
    pub path: PathBuf,
    /// Why it was skipped
    pub reason: SkipReason,
}

impl SkippedFile {
    /// Create a new skip entry
    pub fn new(path: impl Into<PathBuf>, reason: SkipReason) -> Self {
        Self {
            path: path.into(),
            reason,
        }
    }
}

/// Persisted result of one backup run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    /// Unique identifier, also the artifact file stem
    pub backup_id: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Snapshot of the configuration's source paths
    pub source_paths: Vec<PathBuf>,
    /// Files actually archived
    pub total_files: usize,
    /// Bytes actually archived (uncompressed)
    pub total_size_bytes: u64,
    /// Hex SHA-256 over the manifest contents, empty until computed
    pub checksum: String,
    /// Format actually used
    pub compression_type: CompressionType,
    /// Lifecycle status
    pub status: BackupStatus,
    /// Wall-clock time of the run
    pub duration_seconds: f64,
    /// Present only for failed or corrupted records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Files left out during collection
    #[serde(default)]
    pub skipped_files: Vec<SkippedFile>,
    /// Size of the artifact on disk
    #[serde(default)]
    pub artifact_size_bytes: u64,
    /// Identity of the configuration that produced this record
    #[serde(default)]
    pub config_fingerprint: String,
}

impl BackupRecord {
    /// Create a `pending` record for a run of `config`
    pub fn pending(backup_id: impl Into<String>, config: &BackupConfiguration) -> Self {
        Self {
            backup_id: backup_id.into(),
            timestamp: Utc::now(),
            source_paths: config.source_paths.clone(),
            total_files: 0,
            total_size_bytes: 0,
            checksum: String::new(),
            compression_type: config.compression_type,
            status: BackupStatus::Pending,
            duration_seconds: 0.0,
            error_message: None,
            skipped_files: Vec::new(),
            artifact_size_bytes: 0,
            config_fingerprint: config.fingerprint(),
        }
    }

    /// Artifact file name, `<backup_id>.<extension>`
    pub fn artifact_file_name(&self) -> String {
        format!("{}.{}", self.backup_id, self.compression_type.extension())
    }

    /// Artifact location under `backup_location`
    pub fn artifact_path(&self, backup_location: &Path) -> PathBuf {
        backup_location.join(self.artifact_file_name())
    }

    /// Age of the record at `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.timestamp)
    }
}

/// Result of a restore operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreResult {
    /// ID of the backup that was restored
    pub backup_id: String,
    /// Relative paths written under the target
    pub restored_files: Vec<PathBuf>,
    /// Entries not written, with reasons
    pub skipped_files: Vec<SkippedFile>,
    /// Total bytes written
    pub bytes_restored: u64,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// Set when some files could not be moved into place after extraction
    pub error: Option<String>,
}

/// Outcome of a retention sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// Backups whose artifact and record were deleted
    pub deleted: Vec<String>,
    /// Per-record failures; the sweep continued past each of them
    pub failures: Vec<RetentionFailure>,
    /// Expired backups left alone because a restore held them
    pub skipped_in_use: Vec<String>,
    /// Artifacts without a record that were removed
    pub orphans_removed: Vec<PathBuf>,
    /// Bytes freed on disk
    pub bytes_reclaimed: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl SweepReport {
    /// Whether every eligible record was deleted
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One record the sweep could not delete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionFailure {
    /// Backup that stayed behind
    pub backup_id: String,
    /// Error text
    pub error: String,
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total records
    pub total_backups: usize,
    /// Records by status
    pub pending: usize,
    /// Records in progress
    pub in_progress: usize,
    /// Completed records
    pub completed: usize,
    /// Failed records
    pub failed: usize,
    /// Corrupted records
    pub corrupted: usize,
    /// Sum of `artifact_size_bytes` over completed records
    pub total_artifact_bytes: u64,
    /// Sum of `total_size_bytes` over completed records
    pub total_source_bytes: u64,
    /// Oldest record
    pub oldest: Option<DateTime<Utc>>,
    /// Newest record
    pub newest: Option<DateTime<Utc>>,
}

/// Progress callback type
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
    /// Bytes processed so far
    pub bytes_processed: u64,
    /// Total bytes to process (if known)
    pub total_bytes: Option<u64>,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

/// Options for creating a backup
#[derive(Clone, Default)]
pub struct BackupOptions {
    /// Caller-supplied identifier; derived from the timestamp when absent
    pub backup_id: Option<String>,
    /// Cancels the run between chunks
    pub cancellation: Option<CancellationToken>,
    /// Progress callback
    pub progress_callback: Option<ProgressCallback>,
}

impl fmt::Debug for BackupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupOptions")
            .field("backup_id", &self.backup_id)
            .field("cancellation", &self.cancellation.is_some())
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

/// Options for restoring a backup
#[derive(Clone, Default)]
pub struct RestoreOptions {
    /// Replace files that already exist under the target
    pub overwrite_existing: bool,
    /// Verify and report without writing anything
    pub dry_run: bool,
    /// Cancels the restore between chunks
    pub cancellation: Option<CancellationToken>,
    /// Progress callback
    pub progress_callback: Option<ProgressCallback>,
}

impl fmt::Debug for RestoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreOptions")
            .field("overwrite_existing", &self.overwrite_existing)
            .field("dry_run", &self.dry_run)
            .field("cancellation", &self.cancellation.is_some())
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}
