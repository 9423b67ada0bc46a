//! Artifact verification
//!
//! The [`ArchiveVerifier`] streams an artifact back, recomputes its checksum
//! with the same [`ChecksumAccumulator`] the backup used, and compares it to
//! the checksum stored on the record.
//!
//! ## Failure Reasons
//!
//! Callers need to tell "not a valid archive" apart from "valid archive with
//! altered content", so a failed check carries a [`VerificationFailure`]:
//!
//! - `decode_error`: the container could not be read (truncated, corrupt
//!   compression stream, bad CRC, entries out of canonical order, empty)
//! - `checksum_mismatch`: the container decoded cleanly but its content no
//!   longer matches the recorded digest
//! - `missing_artifact`: there is no file at the artifact path
//!
//! ## Example
//!
//! ```rust,ignore
//! use archivist::verification::ArchiveVerifier;
//!
//! # fn example(record: &archivist::BackupRecord, location: &std::path::Path) -> archivist::Result<()> {
//! let result = ArchiveVerifier::new().verify(
//!     &record.artifact_path(location),
//!     record.compression_type,
//!     &record.checksum,
//! )?;
//! if !result.is_valid() {
//!     println!("{}", result.summary());
//! }
//! # Ok(())
//! # }
//! ```

use crate::checksum::{feed, is_cancelled_io, ChecksumAccumulator};
use crate::error::{ArchivistError, Result};
use crate::types::CompressionType;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why an artifact failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFailure {
    /// The container could not be decoded
    DecodeError,
    /// Decoded content does not match the expected checksum
    ChecksumMismatch,
    /// No artifact at the expected path
    MissingArtifact,
}

impl VerificationFailure {
    /// Stable name used in messages and the registry
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationFailure::DecodeError => "decode_error",
            VerificationFailure::ChecksumMismatch => "checksum_mismatch",
            VerificationFailure::MissingArtifact => "missing_artifact",
        }
    }
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file entry found in an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedEntry {
    /// Entry name, `/`-separated
    pub name: String,
    /// Content size
    pub size: u64,
}

/// Result of verifying one artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Whether the artifact decoded and matched
    pub ok: bool,
    /// Set when `ok` is false
    pub reason: Option<VerificationFailure>,
    /// Digest recomputed from the artifact, when decoding got that far
    pub computed_checksum: Option<String>,
    /// Entries read from the artifact
    pub entries: Vec<ArchivedEntry>,
    /// Human-readable detail for failures
    pub detail: Option<String>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl VerificationResult {
    fn passed(checksum: String, entries: Vec<ArchivedEntry>) -> Self {
        Self {
            ok: true,
            reason: None,
            computed_checksum: Some(checksum),
            entries,
            detail: None,
            duration_ms: 0,
        }
    }

    fn failed(reason: VerificationFailure, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            computed_checksum: None,
            entries: Vec::new(),
            detail: Some(detail.into()),
            duration_ms: 0,
        }
    }

    /// Check if the artifact can be trusted
    pub fn is_valid(&self) -> bool {
        self.ok
    }

    /// Total content bytes across entries
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Get a one-line summary
    pub fn summary(&self) -> String {
        match (&self.reason, &self.detail) {
            (None, _) => format!(
                "Artifact valid: {} entries, {} in {}ms",
                self.entries.len(),
                utils::format_bytes(self.total_size()),
                self.duration_ms
            ),
            (Some(reason), Some(detail)) => format!("Artifact invalid ({}): {}", reason, detail),
            (Some(reason), None) => format!("Artifact invalid ({})", reason),
        }
    }
}

/// Why a scan stopped early
enum ScanError {
    Cancelled,
    Decode(String),
}

impl From<io::Error> for ScanError {
    fn from(err: io::Error) -> Self {
        if is_cancelled_io(&err) {
            ScanError::Cancelled
        } else {
            ScanError::Decode(err.to_string())
        }
    }
}

impl From<zip::result::ZipError> for ScanError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => e.into(),
            other => ScanError::Decode(other.to_string()),
        }
    }
}

type Scan = std::result::Result<(String, Vec<ArchivedEntry>), ScanError>;

/// Re-reads artifacts and checks them against their recorded checksum
#[derive(Debug, Clone, Default)]
pub struct ArchiveVerifier {
    cancel: Option<CancellationToken>,
}

impl ArchiveVerifier {
    /// Create a verifier without cancellation
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort verification once `token` fires
    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Verify `artifact` against `expected_checksum`
    ///
    /// Verification problems are reported in the returned
    /// [`VerificationResult`], not as errors.
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::Cancelled`] if the token fires
    pub fn verify(
        &self,
        artifact: &Path,
        compression: CompressionType,
        expected_checksum: &str,
    ) -> Result<VerificationResult> {
        let start = Instant::now();

        let file = match File::open(artifact) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Artifact {:?} is missing", artifact);
                return Ok(VerificationResult::failed(
                    VerificationFailure::MissingArtifact,
                    format!("artifact {:?} does not exist", artifact),
                ));
            }
            Err(e) => {
                return Ok(VerificationResult::failed(
                    VerificationFailure::DecodeError,
                    format!("cannot open artifact {:?}: {}", artifact, e),
                ));
            }
        };
        let reader = BufReader::new(file);

        let scan = match compression {
            CompressionType::None | CompressionType::Tar => self.scan_tar(reader),
            CompressionType::TarGz => self.scan_tar(flate2::read::GzDecoder::new(reader)),
            CompressionType::TarBz2 => self.scan_tar(bzip2::read::BzDecoder::new(reader)),
            CompressionType::Zip => self.scan_zip(reader),
        };

        let mut result = match scan {
            Err(ScanError::Cancelled) => return Err(ArchivistError::Cancelled),
            Err(ScanError::Decode(detail)) => {
                VerificationResult::failed(VerificationFailure::DecodeError, detail)
            }
            Ok((computed, entries)) if computed == expected_checksum => {
                VerificationResult::passed(computed, entries)
            }
            Ok((computed, entries)) => {
                let mut result = VerificationResult::failed(
                    VerificationFailure::ChecksumMismatch,
                    format!("expected {}, computed {}", expected_checksum, computed),
                );
                result.computed_checksum = Some(computed);
                result.entries = entries;
                result
            }
        };
        result.duration_ms = start.elapsed().as_millis() as u64;

        if result.ok {
            debug!("Verified {:?}: {}", artifact, result.summary());
        } else {
            warn!("Verification of {:?} failed: {}", artifact, result.summary());
        }
        Ok(result)
    }

    fn scan_tar<R: Read>(&self, reader: R) -> Scan {
        let cancel = self.cancel.as_ref();
        let mut archive = tar::Archive::new(reader);
        let mut acc = ChecksumAccumulator::new();
        let mut entries: Vec<ArchivedEntry> = Vec::new();

        for item in archive.entries()? {
            let mut entry = item?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = utils::archive_name(&entry.path()?);
            let size = entry.size();
            check_order(&entries, &name)?;

            acc.begin_entry(&name, size);
            let read = feed(&mut acc, &mut entry, cancel)?;
            if read != size {
                return Err(ScanError::Decode(format!(
                    "entry {} is truncated ({} of {} bytes)",
                    name, read, size
                )));
            }
            entries.push(ArchivedEntry { name, size });
        }

        // Drain trailing data so compressed streams validate their trailer
        io::copy(&mut archive.into_inner(), &mut io::sink())?;
        finish(acc, entries)
    }

    fn scan_zip<R: Read + io::Seek>(&self, reader: R) -> Scan {
        let cancel = self.cancel.as_ref();
        let mut archive = zip::ZipArchive::new(reader)?;
        let mut acc = ChecksumAccumulator::new();
        let mut entries: Vec<ArchivedEntry> = Vec::new();

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let name = utils::archive_name(Path::new(entry.name()));
            let size = entry.size();
            check_order(&entries, &name)?;

            acc.begin_entry(&name, size);
            let read = feed(&mut acc, &mut entry, cancel)?;
            if read != size {
                return Err(ScanError::Decode(format!(
                    "entry {} is truncated ({} of {} bytes)",
                    name, read, size
                )));
            }
            entries.push(ArchivedEntry { name, size });
        }

        finish(acc, entries)
    }
}

fn check_order(entries: &[ArchivedEntry], name: &str) -> std::result::Result<(), ScanError> {
    match entries.last() {
        Some(previous) if previous.name.as_str() >= name => Err(ScanError::Decode(format!(
            "entries out of canonical order: {} after {}",
            name, previous.name
        ))),
        _ => Ok(()),
    }
}

fn finish(acc: ChecksumAccumulator, entries: Vec<ArchivedEntry>) -> Scan {
    if entries.is_empty() {
        return Err(ScanError::Decode("archive contains no file entries".to_string()));
    }
    Ok((acc.finish(), entries))
}
