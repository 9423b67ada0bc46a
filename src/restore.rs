//! Restoring backups
//!
//! The [`RestoreEngine`] extracts a completed backup into a target directory.
//! The artifact is verified before anything is written; an artifact that fails
//! verification flips its record to `corrupted` and the restore stops with an
//! integrity error while the target is still untouched.
//!
//! Extraction happens in a hidden staging directory inside the target. Entry
//! contents are hashed again while they are written out, and only after the
//! whole artifact extracted cleanly are files moved into their final place.
//! Cancelling, a decode error or an unsafe entry name discards the staging
//! directory, so a failed restore leaves no partial output behind.

use crate::checksum::{check_cancelled, is_cancelled_io, ChecksumAccumulator, CHUNK_SIZE};
use crate::error::{ArchivistError, Result};
use crate::store::{ClaimKind, MetadataStore};
use crate::types::{
    BackupRecord, BackupStatus, CompressionType, ProgressCallback, ProgressInfo, RestoreOptions,
    RestoreResult, SkipReason, SkippedFile,
};
use crate::utils;
use crate::verification::{ArchiveVerifier, VerificationResult};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Prefix of the staging directory created inside the restore target
const RESTORE_STAGING_PREFIX: &str = ".restore-";

/// A file written into the staging directory
#[derive(Debug)]
struct Extracted {
    relative: PathBuf,
    size: u64,
}

/// Extracts verified backups into target directories
#[derive(Debug, Clone)]
pub struct RestoreEngine {
    store: Arc<MetadataStore>,
}

impl RestoreEngine {
    /// Create a restore engine over `store`
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    /// Restore `backup_id` into `target`
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::NotFound`] if no record exists
    /// - [`ArchivistError::InUse`] if the record is being deleted
    /// - [`ArchivistError::Integrity`] if the record is corrupted or its
    ///   artifact fails verification
    /// - [`ArchivistError::Restore`] if the record is not `completed`, an
    ///   entry name is unsafe or extraction fails
    /// - [`ArchivistError::Cancelled`] if the token fires before files are
    ///   moved into place
    #[instrument(skip(self, options))]
    pub fn restore(
        &self,
        backup_id: &str,
        target: &Path,
        options: &RestoreOptions,
    ) -> Result<RestoreResult> {
        info!("Restoring backup {} into {:?}", backup_id, target);
        let start = Instant::now();

        let _claim = self.store.claim(backup_id, ClaimKind::Restore)?;
        let record = self.store.get(backup_id)?;
        match record.status {
            BackupStatus::Completed => {}
            BackupStatus::Corrupted => {
                return Err(ArchivistError::Integrity {
                    backup_id: backup_id.to_string(),
                    detail: record
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "backup is marked corrupted".to_string()),
                });
            }
            other => {
                return Err(ArchivistError::restore(format!(
                    "backup {} is {} and cannot be restored",
                    backup_id, other
                )));
            }
        }

        let artifact = record.artifact_path(self.store.location());
        let verification = ArchiveVerifier::new()
            .with_cancellation(options.cancellation.clone())
            .verify(&artifact, record.compression_type, &record.checksum)?;
        if !verification.ok {
            return Err(self.mark_corrupted(backup_id, verification.summary()));
        }

        let mut result = if options.dry_run {
            plan(&verification, target, options.overwrite_existing)?
        } else {
            self.extract_into(&record, &artifact, target, options)?
        };

        result.backup_id = backup_id.to_string();
        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Restored backup {}{} in {}ms ({} files, {} skipped, {})",
            backup_id,
            if options.dry_run { " (dry run)" } else { "" },
            result.duration_ms,
            result.restored_files.len(),
            result.skipped_files.len(),
            utils::format_bytes(result.bytes_restored)
        );
        Ok(result)
    }

    fn extract_into(
        &self,
        record: &BackupRecord,
        artifact: &Path,
        target: &Path,
        options: &RestoreOptions,
    ) -> Result<RestoreResult> {
        let created_target = !target.exists();
        fs::create_dir_all(target).map_err(|e| {
            ArchivistError::restore(format!("cannot create target {:?}: {}", target, e))
        })?;

        let outcome = self.stage_and_place(record, artifact, target, options);
        if outcome.is_err() && created_target {
            // Only succeeds if nothing was placed
            fs::remove_dir(target).ok();
        }
        outcome
    }

    fn stage_and_place(
        &self,
        record: &BackupRecord,
        artifact: &Path,
        target: &Path,
        options: &RestoreOptions,
    ) -> Result<RestoreResult> {
        let staging = tempfile::Builder::new()
            .prefix(RESTORE_STAGING_PREFIX)
            .tempdir_in(target)
            .map_err(|e| {
                ArchivistError::restore(format!("cannot stage restore in {:?}: {}", target, e))
            })?;
        trace!("Staging restore in {:?}", staging.path());

        let extractor = Extractor {
            staging: staging.path(),
            cancel: options.cancellation.as_ref(),
            progress: options.progress_callback.as_ref(),
            total: record.total_files,
        };
        let file = File::open(artifact).map_err(io_error)?;
        let reader = BufReader::new(file);
        let (extracted, checksum) = match record.compression_type {
            CompressionType::None | CompressionType::Tar => extractor.tar(reader)?,
            CompressionType::TarGz => extractor.tar(flate2::read::GzDecoder::new(reader))?,
            CompressionType::TarBz2 => extractor.tar(bzip2::read::BzDecoder::new(reader))?,
            CompressionType::Zip => extractor.zip(reader)?,
        };

        if checksum != record.checksum {
            return Err(self.mark_corrupted(
                &record.backup_id,
                format!(
                    "artifact changed during restore: expected {}, computed {}",
                    record.checksum, checksum
                ),
            ));
        }
        check_cancelled(options.cancellation.as_ref())?;

        debug!("Moving {} staged files into {:?}", extracted.len(), target);
        Ok(place(extracted, staging.path(), target, options.overwrite_existing))
    }

    /// Flip a record to `corrupted` and build the matching error
    fn mark_corrupted(&self, backup_id: &str, detail: String) -> ArchivistError {
        let message = detail.clone();
        if let Err(e) = self.store.update(backup_id, |record| {
            record.status = BackupStatus::Corrupted;
            record.error_message = Some(message);
        }) {
            warn!("Could not mark backup {} as corrupted: {}", backup_id, e);
        }
        ArchivistError::Integrity {
            backup_id: backup_id.to_string(),
            detail,
        }
    }
}

/// Writes artifact entries into the staging directory, hashing as it goes
struct Extractor<'a> {
    staging: &'a Path,
    cancel: Option<&'a CancellationToken>,
    progress: Option<&'a ProgressCallback>,
    total: usize,
}

impl Extractor<'_> {
    fn tar<R: Read>(&self, reader: R) -> Result<(Vec<Extracted>, String)> {
        let mut archive = tar::Archive::new(reader);
        let mut acc = ChecksumAccumulator::new();
        let mut extracted = Vec::new();

        for item in archive.entries().map_err(io_error)? {
            let mut entry = item.map_err(io_error)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let raw = entry.path().map_err(io_error)?.to_string_lossy().into_owned();
            let mode = entry.header().mode().ok();
            let size = entry.size();
            extracted.push(self.write_entry(&raw, size, mode, &mut entry, &mut acc)?);
        }

        Ok((extracted, acc.finish()))
    }

    fn zip<R: Read + Seek>(&self, reader: R) -> Result<(Vec<Extracted>, String)> {
        let mut archive = zip::ZipArchive::new(reader).map_err(zip_error)?;
        let mut acc = ChecksumAccumulator::new();
        let mut extracted = Vec::new();

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(zip_error)?;
            if entry.is_dir() {
                continue;
            }
            let raw = entry.name().to_string();
            let mode = entry.unix_mode();
            let size = entry.size();
            extracted.push(self.write_entry(&raw, size, mode, &mut entry, &mut acc)?);
        }

        Ok((extracted, acc.finish()))
    }

    fn write_entry<R: Read>(
        &self,
        raw_name: &str,
        size: u64,
        mode: Option<u32>,
        reader: &mut R,
        acc: &mut ChecksumAccumulator,
    ) -> Result<Extracted> {
        let relative = utils::sanitize_entry_path(raw_name)?;
        let name = utils::archive_name(&relative);
        let staged = self.staging.join(&relative);
        fs::create_dir_all(utils::parent_dir(&staged)).map_err(io_error)?;

        acc.begin_entry(&name, size);
        let mut file = File::create(&staged).map_err(io_error)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            check_cancelled(self.cancel)?;
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_error(e)),
            };
            acc.update(&buffer[..n]);
            file.write_all(&buffer[..n]).map_err(io_error)?;
            written += n as u64;
        }
        drop(file);

        if written != size {
            return Err(ArchivistError::restore(format!(
                "entry {} is truncated ({} of {} bytes)",
                name, written, size
            )));
        }
        if let Some(mode) = mode.map(|m| m & 0o7777).filter(|m| *m != 0) {
            utils::set_permissions(&staged, mode)?;
        }

        trace!("Extracted {}", name);
        if let Some(callback) = self.progress {
            callback(ProgressInfo {
                operation: "Restoring".to_string(),
                current_item: Some(name),
                processed: acc.entries(),
                total: Some(self.total),
                bytes_processed: acc.bytes(),
                total_bytes: None,
            });
        }
        Ok(Extracted { relative, size })
    }
}

/// Dry run: what a restore would write given the current target contents
fn plan(
    verification: &VerificationResult,
    target: &Path,
    overwrite_existing: bool,
) -> Result<RestoreResult> {
    let mut result = RestoreResult::default();
    for entry in &verification.entries {
        let relative = utils::sanitize_entry_path(&entry.name)?;
        if !overwrite_existing && target.join(&relative).symlink_metadata().is_ok() {
            result
                .skipped_files
                .push(SkippedFile::new(relative, SkipReason::AlreadyExists));
        } else {
            result.bytes_restored += entry.size;
            result.restored_files.push(relative);
        }
    }
    Ok(result)
}

/// Move staged files to their final place
///
/// Failures here do not abort the restore; they are collected into
/// [`RestoreResult::error`].
fn place(
    extracted: Vec<Extracted>,
    staging: &Path,
    target: &Path,
    overwrite_existing: bool,
) -> RestoreResult {
    let mut result = RestoreResult::default();
    let mut errors = Vec::new();

    for item in extracted {
        let destination = target.join(&item.relative);
        if destination.symlink_metadata().is_ok() {
            if !overwrite_existing {
                trace!("Keeping existing {:?}", destination);
                result
                    .skipped_files
                    .push(SkippedFile::new(item.relative, SkipReason::AlreadyExists));
                continue;
            }
            if destination.is_dir() {
                errors.push(format!("{:?}: a directory is in the way", item.relative));
                continue;
            }
        }

        let moved = fs::create_dir_all(utils::parent_dir(&destination))
            .and_then(|_| fs::rename(staging.join(&item.relative), &destination));
        match moved {
            Ok(()) => {
                result.bytes_restored += item.size;
                result.restored_files.push(item.relative);
            }
            Err(e) => errors.push(format!("{:?}: {}", item.relative, e)),
        }
    }

    if !errors.is_empty() {
        warn!("{} files could not be moved into place", errors.len());
        result.error = Some(errors.join("; "));
    }
    result
}

fn io_error(err: io::Error) -> ArchivistError {
    if is_cancelled_io(&err) {
        ArchivistError::Cancelled
    } else {
        ArchivistError::restore(err.to_string())
    }
}

fn zip_error(err: zip::result::ZipError) -> ArchivistError {
    match err {
        zip::result::ZipError::Io(e) => io_error(e),
        other => ArchivistError::restore(format!("cannot decode artifact: {}", other)),
    }
}
