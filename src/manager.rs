//! Backup lifecycle orchestration
//!
//! [`BackupManager`] is the main entry point. It owns the metadata store for
//! one backup location and coordinates the other components through a run:
//!
//! 1. **Collect** the files selected by the configuration
//! 2. **Checksum** the manifest from the source files
//! 3. **Write** the artifact through a staging file
//! 4. **Verify** the artifact against the checksum
//! 5. **Record** the outcome and sweep expired backups of the same configuration
//!
//! A run that fails before anything was collected leaves no trace. Once the
//! manifest is known a record exists, and every later failure finalizes it as
//! `failed` with the error text.
//!
//! ## Thread Safety
//!
//! `BackupManager` is `Send + Sync` and meant to be shared through an `Arc`.
//! Runs of the same configuration are serialized by a per-configuration run
//! lock; runs of different configurations proceed in parallel. The run locks
//! and the registry are shared with other processes that open the same
//! location, so a daemon and one-shot commands can work side by side.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use archivist::{BackupConfiguration, BackupManager};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackupConfiguration::builder()
//!     .source_path("./project")
//!     .backup_location("./backups")
//!     .build()?;
//!
//! let manager = BackupManager::for_config(&config)?;
//! let record = manager.create_backup(None, &config)?;
//! println!("Created {} ({} files)", record.backup_id, record.total_files);
//!
//! manager.restore_backup(&record.backup_id, "./restored".as_ref())?;
//! # Ok(())
//! # }
//! ```

use crate::archive::ArchiveWriter;
use crate::checksum::{check_cancelled, ChecksumEngine};
use crate::collector::FileCollector;
use crate::config::BackupConfiguration;
use crate::error::{ArchivistError, Result};
use crate::locks::{RunGuard, RunLocks};
use crate::restore::RestoreEngine;
use crate::retention::RetentionManager;
use crate::store::{ClaimKind, MetadataStore};
use crate::types::*;
use crate::utils;
use crate::verification::{ArchiveVerifier, VerificationResult};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Error text stored on records of cancelled runs
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Backup manager for one backup location
#[derive(Debug)]
pub struct BackupManager {
    /// Location as opened
    location: PathBuf,
    /// Canonical form of `location`, for comparing configurations
    canonical_location: PathBuf,
    /// Registry of backup records
    store: Arc<MetadataStore>,
    /// Expiry of completed backups
    retention: RetentionManager,
    /// Extraction of verified backups
    restore: RestoreEngine,
    /// Per-configuration run locks
    run_locks: RunLocks,
}

impl BackupManager {
    /// Open the backup location, creating it if needed
    ///
    /// Records left `pending` or `in_progress` by a run that died are marked
    /// `failed`. Runs still going on in other instances keep their
    /// configuration's run lock and are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or locked, or the
    /// registry cannot be read.
    #[instrument(skip_all)]
    pub fn open(location: impl AsRef<Path>) -> Result<Self> {
        let location = location.as_ref().to_path_buf();
        let store = Arc::new(MetadataStore::open(&location)?);
        let canonical_location = fs::canonicalize(&location)?;

        let manager = Self {
            retention: RetentionManager::new(Arc::clone(&store)),
            restore: RestoreEngine::new(Arc::clone(&store)),
            run_locks: RunLocks::in_dir(&location),
            location,
            canonical_location,
            store,
        };

        let recovered = manager.recover_interrupted()?;
        if !recovered.is_empty() {
            warn!("Recovered interrupted backups: {}", recovered.join(", "));
        }
        info!(
            "Opened backup location {:?} with {} backups",
            manager.location,
            manager.store.list().len()
        );
        Ok(manager)
    }

    /// Fail active records whose configuration nobody is running
    fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for record in self.store.try_list()? {
            if !record.status.is_active() {
                continue;
            }
            let Some(_guard) = self.run_locks.try_acquire(&record.config_fingerprint) else {
                debug!("Backup {} is still running", record.backup_id);
                continue;
            };
            if self.store.mark_interrupted(&record.backup_id)? {
                recovered.push(record.backup_id);
            }
        }
        Ok(recovered)
    }

    /// Open the backup location named by `config`
    pub fn for_config(config: &BackupConfiguration) -> Result<Self> {
        config.validate()?;
        Self::open(&config.backup_location)
    }

    /// Backup location managed by this instance
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Underlying metadata store
    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Per-configuration run locks
    pub fn run_locks(&self) -> &RunLocks {
        &self.run_locks
    }

    /// Create a backup of `config`
    ///
    /// Waits if another run of the same configuration is in progress. The id
    /// defaults to `backup_YYYYMMDD_HHMMSS` (UTC), with a numeric suffix when
    /// two runs start within the same second.
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::Configuration`] for an invalid configuration or
    ///   one that points at another backup location
    /// - [`ArchivistError::SourceNotFound`] / [`ArchivistError::EmptyManifest`]
    ///   before any record is written
    /// - [`ArchivistError::DuplicateBackupId`] if `backup_id` is taken
    /// - any checksum, archive or integrity error of the run, after the
    ///   record has been marked `failed`
    #[instrument(skip(self, config))]
    pub fn create_backup(
        &self,
        backup_id: Option<String>,
        config: &BackupConfiguration,
    ) -> Result<BackupRecord> {
        self.create_backup_with_options(
            config,
            BackupOptions {
                backup_id,
                ..Default::default()
            },
        )
    }

    /// Create a backup with cancellation and progress reporting
    ///
    /// Blocks the calling thread for the whole run, including any wait for
    /// the run lock. Async callers should prefer `spawn_blocking` so the
    /// runtime's workers stay free.
    #[instrument(skip(self, config, options))]
    pub fn create_backup_with_options(
        &self,
        config: &BackupConfiguration,
        options: BackupOptions,
    ) -> Result<BackupRecord> {
        self.check_config(config)?;
        let guard = self.run_locks.acquire(&config.fingerprint())?;
        self.run_locked(guard, config, options)
    }

    /// Create a backup unless one of the same configuration is running
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::Busy`] if the run lock is held
    /// - everything [`create_backup`](Self::create_backup) returns
    pub fn try_create_backup(
        &self,
        backup_id: Option<String>,
        config: &BackupConfiguration,
    ) -> Result<BackupRecord> {
        self.check_config(config)?;
        let fingerprint = config.fingerprint();
        let guard = self
            .run_locks
            .try_acquire(&fingerprint)
            .ok_or(ArchivistError::Busy(fingerprint))?;
        self.run_locked(
            guard,
            config,
            BackupOptions {
                backup_id,
                ..Default::default()
            },
        )
    }

    /// Perform a run while holding the configuration's run lock
    pub(crate) fn run_locked(
        &self,
        guard: RunGuard,
        config: &BackupConfiguration,
        options: BackupOptions,
    ) -> Result<BackupRecord> {
        let start = Instant::now();
        debug!("Run lock {} held", guard.key());

        if let Some(id) = &options.backup_id {
            if !utils::is_valid_backup_id(id) {
                return Err(ArchivistError::configuration(format!(
                    "invalid backup id {:?}: use letters, digits, '-', '_' and '.'",
                    id
                )));
            }
            let artifact = self
                .location
                .join(format!("{}.{}", id, config.compression_type.extension()));
            if self.store.contains(id) || artifact.exists() {
                return Err(ArchivistError::DuplicateBackupId(id.clone()));
            }
        }

        info!(
            "Starting backup of {} source path(s) into {:?}",
            config.source_paths.len(),
            self.location
        );

        let collection = FileCollector::from_config(config)?.collect(&config.source_paths)?;
        if !collection.skipped.is_empty() {
            info!("{} files skipped during collection", collection.skipped.len());
        }
        check_cancelled(options.cancellation.as_ref())?;

        let mut pending = BackupRecord::pending(
            options
                .backup_id
                .clone()
                .unwrap_or_else(|| generate_backup_id(Utc::now())),
            config,
        );
        pending.total_files = collection.manifest.len();
        pending.total_size_bytes = collection.manifest.total_size;
        pending.skipped_files = collection.skipped;

        let record = if options.backup_id.is_some() {
            self.store.put(pending.clone())?;
            pending
        } else {
            self.store.put_with_unique_id(pending)?
        };
        let backup_id = record.backup_id.clone();
        self.store
            .update(&backup_id, |r| r.status = BackupStatus::InProgress)?;

        match self.execute(&record, &collection.manifest, config, &options) {
            Ok((checksum, artifact_size)) => {
                let duration = start.elapsed().as_secs_f64();
                let record = self.store.update(&backup_id, |r| {
                    r.status = BackupStatus::Completed;
                    r.checksum = checksum;
                    r.artifact_size_bytes = artifact_size;
                    r.duration_seconds = duration;
                })?;
                info!(
                    "Backup {} completed in {:.2}s ({} files, {} -> {})",
                    backup_id,
                    duration,
                    record.total_files,
                    utils::format_bytes(record.total_size_bytes),
                    utils::format_bytes(artifact_size)
                );

                self.sweep_after_run(config);
                Ok(record)
            }
            Err(e) => {
                let duration = start.elapsed().as_secs_f64();
                let message = if e.is_cancelled() {
                    CANCELLED_MESSAGE.to_string()
                } else {
                    e.to_string()
                };
                warn!("Backup {} failed: {}", backup_id, message);

                if let Err(update_err) = self.store.update(&backup_id, |r| {
                    r.status = BackupStatus::Failed;
                    r.error_message = Some(message);
                    r.duration_seconds = duration;
                }) {
                    warn!("Could not record failure of {}: {}", backup_id, update_err);
                }
                Err(e)
            }
        }
    }

    /// Checksum, write and verify; returns checksum and artifact size
    fn execute(
        &self,
        record: &BackupRecord,
        manifest: &Manifest,
        config: &BackupConfiguration,
        options: &BackupOptions,
    ) -> Result<(String, u64)> {
        let checksum = ChecksumEngine::new()
            .with_cancellation(options.cancellation.clone())
            .with_progress(options.progress_callback.clone())
            .compute(manifest)?;
        debug!("Manifest checksum {}", checksum);

        let artifact = record.artifact_path(&self.location);
        ArchiveWriter::new()
            .with_cancellation(options.cancellation.clone())
            .with_progress(options.progress_callback.clone())
            .write(manifest, config.compression_type, &artifact)?;

        let verification = ArchiveVerifier::new()
            .with_cancellation(options.cancellation.clone())
            .verify(&artifact, config.compression_type, &checksum);
        let failure = match verification {
            Ok(result) if result.ok => None,
            Ok(result) => Some(ArchivistError::Integrity {
                backup_id: record.backup_id.clone(),
                detail: result.summary(),
            }),
            Err(e) => Some(e),
        };
        if let Some(err) = failure {
            if let Err(e) = utils::remove_file_if_exists(&artifact) {
                warn!("Could not remove rejected artifact {:?}: {}", artifact, e);
            }
            return Err(err);
        }

        let size = fs::metadata(&artifact)?.len();
        Ok((checksum, size))
    }

    /// Expire old backups of the configuration that just ran
    fn sweep_after_run(&self, config: &BackupConfiguration) {
        let fingerprint = config.fingerprint();
        match self
            .retention
            .sweep_matching(Utc::now(), config.retention_days, |r| {
                r.config_fingerprint == fingerprint
            }) {
            Ok(report) if !report.is_clean() => {
                for failure in &report.failures {
                    warn!("Retention could not delete {}: {}", failure.backup_id, failure.error);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Retention sweep after backup failed: {}", e),
        }
    }

    /// All backup records, oldest first
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.store.list())
    }

    /// Current record of one backup
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::NotFound`] if no record has this id
    pub fn get_backup_status(&self, backup_id: &str) -> Result<BackupRecord> {
        self.store.get(backup_id)
    }

    /// Restore a backup into `target` without overwriting existing files
    #[instrument(skip(self))]
    pub fn restore_backup(&self, backup_id: &str, target: &Path) -> Result<RestoreResult> {
        self.restore_backup_with_options(backup_id, target, &RestoreOptions::default())
    }

    /// Restore a backup with explicit options
    ///
    /// See [`RestoreEngine::restore`] for the error cases.
    pub fn restore_backup_with_options(
        &self,
        backup_id: &str,
        target: &Path,
        options: &RestoreOptions,
    ) -> Result<RestoreResult> {
        self.restore.restore(backup_id, target, options)
    }

    /// Re-verify a backup's artifact
    ///
    /// A `completed` backup that fails verification is marked `corrupted`.
    #[instrument(skip(self))]
    pub fn verify_backup(&self, backup_id: &str) -> Result<VerificationResult> {
        let _claim = self.store.claim(backup_id, ClaimKind::Restore)?;
        let record = self.store.get(backup_id)?;

        let result = ArchiveVerifier::new().verify(
            &record.artifact_path(&self.location),
            record.compression_type,
            &record.checksum,
        )?;

        if !result.ok && record.status == BackupStatus::Completed {
            let detail = result.summary();
            self.store.update(backup_id, |r| {
                r.status = BackupStatus::Corrupted;
                r.error_message = Some(detail);
            })?;
            warn!("Backup {} is corrupted", backup_id);
        }
        Ok(result)
    }

    /// Delete a backup's artifact and record regardless of age or status
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::NotFound`] if no record has this id
    /// - [`ArchivistError::InUse`] if a restore holds the record
    /// - [`ArchivistError::Busy`] if the backup is still being written
    #[instrument(skip(self))]
    pub fn delete_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        let _claim = self.store.claim(backup_id, ClaimKind::Delete)?;
        let record = self.store.get(backup_id)?;

        if record.status.is_active() && self.run_locks.is_running(&record.config_fingerprint) {
            return Err(ArchivistError::Busy(backup_id.to_string()));
        }

        let artifact = record.artifact_path(&self.location);
        utils::remove_file_if_exists(&artifact).map_err(|e| {
            ArchivistError::retention(backup_id, format!("cannot delete artifact {:?}: {}", artifact, e))
        })?;
        let removed = self.store.delete(backup_id)?;

        info!("Deleted backup {}", backup_id);
        Ok(removed)
    }

    /// Run retention for one configuration
    ///
    /// Takes the configuration's run lock so it never overlaps a backup of
    /// the same configuration.
    #[instrument(skip(self, config))]
    pub fn sweep_retention(&self, config: &BackupConfiguration) -> Result<SweepReport> {
        self.check_config(config)?;
        let fingerprint = config.fingerprint();
        let _guard = self.run_locks.acquire(&fingerprint)?;
        self.retention
            .sweep_matching(Utc::now(), config.retention_days, |r| {
                r.config_fingerprint == fingerprint
            })
    }

    /// Backups the next sweep of `config` would delete
    pub fn preview_retention(&self, config: &BackupConfiguration) -> Result<Vec<BackupRecord>> {
        self.check_config(config)?;
        let fingerprint = config.fingerprint();
        Ok(self
            .retention
            .expired(Utc::now(), config.retention_days, |r| {
                r.config_fingerprint == fingerprint
            }))
    }

    /// Registry statistics
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub(crate) fn check_config(&self, config: &BackupConfiguration) -> Result<()> {
        config.validate()?;
        let same_location = config.backup_location == self.location
            || fs::canonicalize(&config.backup_location)
                .map(|p| p == self.canonical_location)
                .unwrap_or(false);
        if !same_location {
            return Err(ArchivistError::configuration(format!(
                "configuration targets {:?} but this manager manages {:?}",
                config.backup_location, self.location
            )));
        }
        Ok(())
    }
}

/// Default backup id for a run started at `now`
pub fn generate_backup_id(now: DateTime<Utc>) -> String {
    format!("backup_{}", now.format("%Y%m%d_%H%M%S"))
}
