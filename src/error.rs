//! Error types for the archivist library
//!
//! Every failure a backup run, restore or retention sweep can hit maps onto one
//! variant of [`ArchivistError`]. The display text of an error is what ends up
//! in [`BackupRecord::error_message`](crate::types::BackupRecord) when a run is
//! finalized as `failed` or `corrupted`, so messages are written to be read by
//! an operator looking at the registry.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the archivist library
pub type Result<T> = std::result::Result<T, ArchivistError>;

/// Main error type for all archivist operations
#[derive(Debug, Error)]
pub enum ArchivistError {
    /// A configuration field is invalid
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A configured source root does not exist
    #[error("Source path not found: {0:?}")]
    SourceNotFound(PathBuf),

    /// Nothing left to back up after filtering
    #[error("Nothing to back up: no files matched in {0} source path(s)")]
    EmptyManifest(usize),

    /// Hashing a manifest entry failed
    #[error("Checksum computation failed for {path:?}: {reason}")]
    Checksum {
        /// File being hashed when the failure happened
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Writing or compressing the artifact failed
    #[error("Archive creation failed: {0}")]
    ArchiveCreation(String),

    /// An artifact failed verification
    #[error("Integrity check failed for backup {backup_id}: {detail}")]
    Integrity {
        /// Backup whose artifact failed verification
        backup_id: String,
        /// What the verifier reported
        detail: String,
    },

    /// Unknown backup identifier
    #[error("Backup not found: {0}")]
    NotFound(String),

    /// Extraction failed
    #[error("Restore failed: {0}")]
    Restore(String),

    /// Deleting an expired backup failed
    #[error("Retention failed for backup {backup_id}: {reason}")]
    Retention {
        /// Backup that could not be deleted
        backup_id: String,
        /// Underlying failure
        reason: String,
    },

    /// A caller-supplied backup identifier is already taken
    #[error("Backup id already exists: {0}")]
    DuplicateBackupId(String),

    /// A status change that would break the record lifecycle
    #[error("Invalid status transition for backup {backup_id}: {from} -> {to}")]
    InvalidTransition {
        /// Backup being updated
        backup_id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// The record is claimed by a concurrent restore or deletion
    #[error("Backup {0} is in use by another operation")]
    InUse(String),

    /// Another run for the same configuration holds the run lock
    #[error("A backup for configuration {0} is already running")]
    Busy(String),

    /// The caller cancelled the operation
    #[error("cancelled")]
    Cancelled,

    /// Scheduling errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Pattern parsing error
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArchivistError {
    /// Create a configuration error with a custom message
    pub fn configuration(msg: impl Into<String>) -> Self {
        ArchivistError::Configuration(msg.into())
    }

    /// Create an archive creation error with a custom message
    pub fn archive(msg: impl Into<String>) -> Self {
        ArchivistError::ArchiveCreation(msg.into())
    }

    /// Create a restore error with a custom message
    pub fn restore(msg: impl Into<String>) -> Self {
        ArchivistError::Restore(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ArchivistError::Internal(msg.into())
    }

    /// Create a checksum error for a file
    pub fn checksum(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ArchivistError::Checksum {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a retention error for a backup
    pub fn retention(backup_id: impl Into<String>, reason: impl ToString) -> Self {
        ArchivistError::Retention {
            backup_id: backup_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ArchivistError::Busy(_) | ArchivistError::InUse(_) | ArchivistError::Cancelled
        )
    }

    /// Check if this error means an artifact can no longer be trusted
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, ArchivistError::Integrity { .. })
    }

    /// Check if this error comes from cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ArchivistError::Cancelled)
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            ArchivistError::NotFound(id) => {
                format!("Backup '{}' not found. Use 'list' to see available backups.", id)
            }
            ArchivistError::SourceNotFound(path) => {
                format!("Source path {:?} does not exist. Check 'source_paths' in the configuration.", path)
            }
            ArchivistError::EmptyManifest(_) => {
                "No files were selected for backup. Check 'exclude_patterns', 'include_hidden' \
                 and 'max_file_size_bytes'."
                    .to_string()
            }
            ArchivistError::Integrity { backup_id, detail } => {
                format!(
                    "Backup '{}' failed verification ({}). It has been marked corrupted; \
                     restore from an older backup.",
                    backup_id, detail
                )
            }
            ArchivistError::Busy(_) => {
                "Another backup for this configuration is running. Try again later.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
