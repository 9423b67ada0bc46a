//! # Archivist - Backup lifecycle management
//!
//! A library for creating, verifying, restoring and expiring compressed
//! backups of directory trees.
//!
//! ## Overview
//!
//! Archivist turns a [`BackupConfiguration`] into a single artifact file per
//! run and keeps a registry of every run in the backup location. It lets you:
//! - Create tar, tar.gz, tar.bz2 or zip backups of one or more source paths
//! - Detect corruption with a content checksum that is independent of the
//!   container format
//! - Restore a verified backup into any directory without clobbering
//!   existing files
//! - Expire completed backups after a retention horizon
//! - Run backups on a recurring schedule
//!
//! ## Architecture
//!
//! - **Collection**: [`FileCollector`] walks the source paths, applies the
//!   exclude patterns and size ceiling, and produces a sorted [`Manifest`]
//! - **Checksums**: [`ChecksumEngine`] hashes names, sizes and contents in
//!   manifest order with SHA-256
//! - **Artifacts**: [`ArchiveWriter`] stages the artifact and renames it into
//!   place; [`ArchiveVerifier`] re-reads it and recomputes the checksum
//! - **Registry**: [`MetadataStore`] keeps one JSON file of [`BackupRecord`]s,
//!   written atomically
//! - **Lifecycle**: [`RetentionManager`], [`RestoreEngine`] and [`Scheduler`]
//!   act on the registry; [`BackupManager`] ties everything together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archivist::{BackupConfiguration, BackupManager, CompressionType, Retention};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackupConfiguration::builder()
//!     .source_path("./my_project")
//!     .backup_location("./backups")
//!     .compression(CompressionType::TarGz)
//!     .retention(Retention::Days(14))
//!     .build()?;
//!
//! let manager = BackupManager::for_config(&config)?;
//!
//! // Create a backup
//! let record = manager.create_backup(None, &config)?;
//! println!("Created backup {} with {} files", record.backup_id, record.total_files);
//!
//! // Restore it somewhere else
//! let result = manager.restore_backup(&record.backup_id, "./restored".as_ref())?;
//! println!("Restored {} files", result.restored_files.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Scheduled Backups
//!
//! ```rust,no_run
//! use archivist::{BackupConfiguration, BackupManager, Scheduler};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackupConfiguration::from_json_file("backup.json".as_ref())?;
//! let manager = Arc::new(BackupManager::for_config(&config)?);
//!
//! let scheduler = Scheduler::new(manager);
//! let handle = scheduler.schedule_automatic_backup(config, "daily")?;
//!
//! tokio::signal::ctrl_c().await?;
//! handle.cancel();
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - The artifact path holds either a complete, verified artifact or nothing
//! - A backup with nothing to archive writes neither an artifact nor a record
//! - Restore never writes anything from an artifact that fails verification
//! - Retention only deletes completed backups, artifact first

// Public API modules
pub mod archive;
pub mod checksum;
pub mod collector;
pub mod config;
pub mod error;
pub mod locks;
pub mod manager;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod utils;
pub mod verification;

// Re-export main types for convenience
pub use archive::ArchiveWriter;
pub use checksum::{ChecksumAccumulator, ChecksumEngine};
pub use collector::{Collection, FileCollector};
pub use config::{BackupConfiguration, BackupConfigurationBuilder, Retention};
pub use error::{ArchivistError, Result};
pub use locks::{RunGuard, RunLocks};
pub use manager::BackupManager;
pub use restore::RestoreEngine;
pub use retention::RetentionManager;
pub use scheduler::{Cadence, ScheduleHandle, ScheduleStats, Scheduler, SchedulerState};
pub use store::{ClaimKind, MetadataStore};
pub use types::*;
pub use verification::{ArchiveVerifier, VerificationFailure, VerificationResult};

// Cancellation tokens appear in the public options types
pub use tokio_util::sync::CancellationToken;
