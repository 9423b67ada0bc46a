//! Artifact writing
//!
//! The [`ArchiveWriter`] turns a [`Manifest`] into one artifact file in the
//! selected [`CompressionType`]. Entries are written in manifest order under
//! their archive names, so the container order is already the canonical
//! checksum order.
//!
//! ## Formats
//!
//! | Compression | Container | Extension |
//! |-------------|-----------|-----------|
//! | `none`      | tar       | `.tar`    |
//! | `tar`       | tar       | `.tar`    |
//! | `tar.gz`    | tar+gzip  | `.tar.gz` |
//! | `tar.bz2`   | tar+bzip2 | `.tar.bz2`|
//! | `zip`       | zip (deflate) | `.zip` |
//!
//! ## Atomicity
//!
//! The artifact is written to a uniquely named staging file in the
//! destination's directory, flushed to disk and renamed into place. On any
//! failure, including cancellation, the staging file is dropped and deleted,
//! so the destination path either holds a complete artifact or nothing.
//!
//! ## Example
//!
//! ```rust,ignore
//! use archivist::archive::ArchiveWriter;
//! use archivist::types::CompressionType;
//!
//! # fn example(manifest: &archivist::types::Manifest) -> archivist::Result<()> {
//! let artifact = ArchiveWriter::new().write(
//!     manifest,
//!     CompressionType::TarGz,
//!     std::path::Path::new("/var/backups/backup_20240101_000000.tar.gz"),
//! )?;
//! # Ok(())
//! # }
//! ```

use crate::checksum::{is_cancelled_io, GuardedReader};
use crate::error::{ArchivistError, Result};
use crate::types::{CompressionType, Manifest, ProgressCallback, ProgressInfo};
use crate::utils::{self, STAGING_PREFIX};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use zip::write::SimpleFileOptions;

/// Writes manifests into artifact files
#[derive(Clone, Default)]
pub struct ArchiveWriter {
    cancel: Option<CancellationToken>,
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("cancel", &self.cancel.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl ArchiveWriter {
    /// Create a writer without cancellation or progress reporting
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the write once `token` fires
    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Report per-file progress
    pub fn with_progress(mut self, callback: Option<ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Write `manifest` to `destination`
    ///
    /// # Returns
    ///
    /// The final artifact path (equal to `destination`).
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::ArchiveCreation`] if reading a source file,
    ///   compressing, writing or renaming fails
    /// - [`ArchivistError::Cancelled`] if the token fires
    pub fn write(
        &self,
        manifest: &Manifest,
        compression: CompressionType,
        destination: &Path,
    ) -> Result<PathBuf> {
        let start = Instant::now();
        let dir = utils::parent_dir(destination);
        fs::create_dir_all(dir)
            .map_err(|e| ArchivistError::archive(format!("cannot create {:?}: {}", dir, e)))?;

        let mut staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(".partial")
            .tempfile_in(dir)
            .map_err(|e| ArchivistError::archive(format!("cannot stage artifact in {:?}: {}", dir, e)))?;
        trace!("Staging artifact at {:?}", staged.path());

        match compression {
            CompressionType::None | CompressionType::Tar => {
                self.write_tar(staged.as_file_mut(), manifest).map_err(map_io)?;
            }
            CompressionType::TarGz => {
                let encoder =
                    flate2::write::GzEncoder::new(staged.as_file_mut(), flate2::Compression::default());
                let encoder = self.write_tar(encoder, manifest).map_err(map_io)?;
                encoder.finish().map_err(map_io)?;
            }
            CompressionType::TarBz2 => {
                let encoder =
                    bzip2::write::BzEncoder::new(staged.as_file_mut(), bzip2::Compression::default());
                let encoder = self.write_tar(encoder, manifest).map_err(map_io)?;
                encoder.finish().map_err(map_io)?;
            }
            CompressionType::Zip => {
                self.write_zip(staged.as_file_mut(), manifest).map_err(map_zip)?;
            }
        }

        staged.as_file().sync_all().map_err(map_io)?;
        staged
            .persist(destination)
            .map_err(|e| ArchivistError::archive(format!("cannot move artifact into place: {}", e.error)))?;

        let artifact_size = fs::metadata(destination).map(|m| m.len()).unwrap_or(0);
        info!(
            "Wrote {} artifact {:?} ({} files, {} -> {}) in {:?}",
            compression,
            destination,
            manifest.len(),
            utils::format_bytes(manifest.total_size),
            utils::format_bytes(artifact_size),
            start.elapsed()
        );
        Ok(destination.to_path_buf())
    }

    fn write_tar<W: Write>(&self, writer: W, manifest: &Manifest) -> io::Result<W> {
        let cancel = self.cancel.as_ref();
        let mut builder = tar::Builder::new(writer);

        for (index, entry) in manifest.iter().enumerate() {
            let file = File::open(&entry.path).map_err(|e| with_path(&entry.path, e))?;
            let reader = GuardedReader::new(BufReader::new(file), entry.size, cancel);

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(entry.size);
            header.set_mode(entry.permissions);
            header.set_mtime(entry.modified.timestamp().max(0) as u64);

            builder
                .append_data(&mut header, &entry.archive_name, reader)
                .map_err(|e| with_path(&entry.path, e))?;
            self.report(index, manifest, &entry.archive_name);
        }

        builder.into_inner()
    }

    fn write_zip<W: Write + Seek>(&self, writer: W, manifest: &Manifest) -> zip::result::ZipResult<W> {
        let cancel = self.cancel.as_ref();
        let mut zip = zip::ZipWriter::new(writer);

        for (index, entry) in manifest.iter().enumerate() {
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .unix_permissions(entry.permissions)
                .large_file(entry.size >= u64::from(u32::MAX));
            zip.start_file(entry.archive_name.as_str(), options)?;

            let file = File::open(&entry.path).map_err(|e| with_path(&entry.path, e))?;
            let mut reader = GuardedReader::new(BufReader::new(file), entry.size, cancel);
            io::copy(&mut reader, &mut zip).map_err(|e| with_path(&entry.path, e))?;
            self.report(index, manifest, &entry.archive_name);
        }

        zip.finish()
    }

    fn report(&self, index: usize, manifest: &Manifest, name: &str) {
        trace!("Archived {}", name);
        if let Some(callback) = &self.progress {
            callback(ProgressInfo {
                operation: "Archiving".to_string(),
                current_item: Some(name.to_string()),
                processed: index + 1,
                total: Some(manifest.len()),
                bytes_processed: 0,
                total_bytes: Some(manifest.total_size),
            });
        }
    }
}

/// Attach the source path to an I/O error, keeping cancellation markers intact
fn with_path(path: &Path, err: io::Error) -> io::Error {
    if is_cancelled_io(&err) {
        return err;
    }
    io::Error::new(err.kind(), format!("{:?}: {}", path, err))
}

fn map_io(err: io::Error) -> ArchivistError {
    if is_cancelled_io(&err) {
        debug!("Artifact write cancelled");
        ArchivistError::Cancelled
    } else {
        ArchivistError::archive(err.to_string())
    }
}

fn map_zip(err: zip::result::ZipError) -> ArchivistError {
    match err {
        zip::result::ZipError::Io(e) => map_io(e),
        other => ArchivistError::archive(other.to_string()),
    }
}
