//! Retention sweeps
//!
//! The [`RetentionManager`] deletes completed backups older than the
//! retention horizon. For every expired record it removes the artifact first
//! and the record second, so an interruption between the two leaves an
//! orphaned artifact rather than a record pointing at nothing. Orphaned
//! artifacts are detected and removed by the next sweep.
//!
//! Only `completed` records age out. Failed, corrupted and unfinished records
//! stay until an operator deletes them, since they are the evidence of what
//! went wrong.
//!
//! A failure to delete one backup is recorded in the [`SweepReport`] and the
//! sweep moves on to the next one.

use crate::config::Retention;
use crate::error::{ArchivistError, Result};
use crate::store::{ClaimKind, MetadataStore};
use crate::types::{BackupRecord, BackupStatus, CompressionType, RetentionFailure, SweepReport};
use crate::utils;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Deletes expired backups from a [`MetadataStore`]
#[derive(Debug, Clone)]
pub struct RetentionManager {
    store: Arc<MetadataStore>,
}

impl RetentionManager {
    /// Create a retention manager over `store`
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    /// Delete every completed backup older than the horizon
    ///
    /// # Returns
    ///
    /// A [`SweepReport`] listing deleted ids and per-record failures.
    #[instrument(skip(self))]
    pub fn sweep(&self, now: DateTime<Utc>, retention: Retention) -> Result<SweepReport> {
        self.sweep_matching(now, retention, |_| true)
    }

    /// Like [`sweep`](Self::sweep), restricted to records accepted by `filter`
    ///
    /// Orphaned artifacts are removed regardless of the filter.
    pub fn sweep_matching<F>(
        &self,
        now: DateTime<Utc>,
        retention: Retention,
        filter: F,
    ) -> Result<SweepReport>
    where
        F: Fn(&BackupRecord) -> bool,
    {
        let start = Instant::now();
        let mut report = SweepReport::default();

        for record in self.expired(now, retention, &filter) {
            let id = record.backup_id.clone();
            let claim = match self.store.claim(&id, ClaimKind::Delete) {
                Ok(claim) => claim,
                Err(ArchivistError::InUse(_)) => {
                    debug!("Backup {} is in use, leaving it for the next sweep", id);
                    report.skipped_in_use.push(id);
                    continue;
                }
                Err(e) => {
                    report.failures.push(RetentionFailure {
                        backup_id: id,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            // Re-check under the claim; a verification may have changed it
            match self.store.get(&id) {
                Ok(current) if is_expired(&current, now, retention) => {}
                _ => continue,
            }

            match self.delete_backup(&record) {
                Ok(bytes) => {
                    report.bytes_reclaimed += bytes;
                    report.deleted.push(id);
                }
                Err(e) => {
                    warn!("Failed to delete expired backup {}: {}", id, e);
                    report.failures.push(RetentionFailure {
                        backup_id: id,
                        error: e.to_string(),
                    });
                }
            }
            drop(claim);
        }

        match self.find_orphaned_artifacts() {
            Ok(orphans) => {
                for path in orphans {
                    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    match utils::remove_file_if_exists(&path) {
                        Ok(_) => {
                            debug!("Removed orphaned artifact {:?}", path);
                            report.bytes_reclaimed += size;
                            report.orphans_removed.push(path);
                        }
                        Err(e) => {
                            warn!("Failed to remove orphaned artifact {:?}: {}", path, e);
                            report.failures.push(RetentionFailure {
                                backup_id: path.to_string_lossy().into_owned(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => warn!("Could not scan for orphaned artifacts: {}", e),
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Retention sweep ({}) complete in {}ms: {} deleted, {} failed, {} in use, {} orphans, {} reclaimed",
            retention,
            report.duration_ms,
            report.deleted.len(),
            report.failures.len(),
            report.skipped_in_use.len(),
            report.orphans_removed.len(),
            utils::format_bytes(report.bytes_reclaimed)
        );
        Ok(report)
    }

    /// Records a sweep would delete right now (dry run)
    pub fn expired<F>(&self, now: DateTime<Utc>, retention: Retention, filter: F) -> Vec<BackupRecord>
    where
        F: Fn(&BackupRecord) -> bool,
    {
        self.store
            .list()
            .into_iter()
            .filter(|record| is_expired(record, now, retention) && filter(record))
            .collect()
    }

    /// Artifact files in the backup location that no record refers to
    ///
    /// Only files named `<valid backup id>.<artifact extension>` are
    /// considered; anything else in the directory is left alone.
    pub fn find_orphaned_artifacts(&self) -> Result<Vec<PathBuf>> {
        let mut candidates = Vec::new();
        for entry in fs::read_dir(self.store.location())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if looks_like_artifact(&name) {
                candidates.push((name, entry.path()));
            }
        }

        // Records are written before their artifacts, so reading the registry
        // after the directory sees every run that already produced a file
        let known: HashSet<String> = self
            .store
            .try_list()?
            .iter()
            .map(BackupRecord::artifact_file_name)
            .collect();

        let mut orphans: Vec<PathBuf> = candidates
            .into_iter()
            .filter(|(name, _)| !known.contains(name))
            .map(|(_, path)| path)
            .collect();
        orphans.sort();
        Ok(orphans)
    }

    /// Remove artifact then record; returns the bytes freed
    fn delete_backup(&self, record: &BackupRecord) -> Result<u64> {
        let id = &record.backup_id;
        let artifact = record.artifact_path(self.store.location());
        let size = fs::metadata(&artifact).map(|m| m.len()).unwrap_or(0);

        utils::remove_file_if_exists(&artifact).map_err(|e| {
            ArchivistError::retention(id, format!("cannot delete artifact {:?}: {}", artifact, e))
        })?;
        self.store
            .delete(id)
            .map_err(|e| ArchivistError::retention(id, e))?;

        debug!("Deleted expired backup {} ({} bytes)", id, size);
        Ok(size)
    }
}

fn is_expired(record: &BackupRecord, now: DateTime<Utc>, retention: Retention) -> bool {
    match retention.horizon() {
        Some(horizon) => record.status == BackupStatus::Completed && record.age(now) > horizon,
        None => false,
    }
}

fn looks_like_artifact(name: &str) -> bool {
    CompressionType::ALL.iter().any(|compression| {
        name.strip_suffix(compression.extension())
            .and_then(|rest| rest.strip_suffix('.'))
            .is_some_and(utils::is_valid_backup_id)
    })
}
