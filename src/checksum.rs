//! Deterministic content checksums
//!
//! The checksum of a backup is a single SHA-256 over every manifest entry in
//! canonical (sorted) order. Each entry contributes:
//!
//! ```text
//! archive name bytes | 0x00 | size as u64 little-endian | content bytes
//! ```
//!
//! File-system metadata such as mtime or permissions never enters the digest,
//! so the same file set hashes identically on any machine and on every rerun.
//! The [`ArchiveVerifier`](crate::verification::ArchiveVerifier) feeds the same
//! [`ChecksumAccumulator`] from the artifact's entries, which is what makes an
//! artifact checkable against its record.
//!
//! Content is streamed in 8 KiB chunks and the cancellation token is checked
//! between chunks.

use crate::error::{ArchivistError, Result};
use crate::types::{Manifest, ProgressCallback, ProgressInfo};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Read buffer size for hashing and copying
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Running digest over a sequence of entries
#[derive(Clone)]
pub struct ChecksumAccumulator {
    hasher: Sha256,
    entries: usize,
    bytes: u64,
}

impl Default for ChecksumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumAccumulator {
    /// Start an empty digest
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            entries: 0,
            bytes: 0,
        }
    }

    /// Begin the next entry; its content follows through [`update`](Self::update)
    pub fn begin_entry(&mut self, name: &str, size: u64) {
        self.hasher.update(name.as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update(size.to_le_bytes());
        self.entries += 1;
    }

    /// Feed content of the current entry
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of entries hashed so far
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Content bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the hex digest
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Marker carried inside an `io::Error` when a token fires mid-stream
#[derive(Debug)]
pub(crate) struct CancelledIo;

impl fmt::Display for CancelledIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cancelled")
    }
}

impl std::error::Error for CancelledIo {}

/// Build the `io::Error` used to unwind a cancelled stream
pub(crate) fn cancelled_io() -> io::Error {
    io::Error::new(io::ErrorKind::Other, CancelledIo)
}

/// Check whether an `io::Error` came from cancellation
pub(crate) fn is_cancelled_io(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<CancelledIo>())
}

/// Check a token, turning a fired token into [`ArchivistError::Cancelled`]
pub(crate) fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(ArchivistError::Cancelled),
        _ => Ok(()),
    }
}

/// Reader that yields exactly `expected` bytes of a source file
///
/// Fails if the file turns out shorter or longer than recorded in the
/// manifest, and fails with a cancellation error once the token fires.
pub(crate) struct GuardedReader<'a, R> {
    inner: R,
    remaining: u64,
    cancel: Option<&'a CancellationToken>,
}

impl<'a, R: Read> GuardedReader<'a, R> {
    pub(crate) fn new(inner: R, expected: u64, cancel: Option<&'a CancellationToken>) -> Self {
        Self {
            inner,
            remaining: expected,
            cancel,
        }
    }
}

impl<R: Read> Read for GuardedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(cancelled_io());
        }

        if self.remaining == 0 {
            let mut probe = [0u8; 1];
            return match self.inner.read(&mut probe)? {
                0 => Ok(0),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "file grew after it was collected",
                )),
            };
        }

        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 && max > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank after it was collected ({} bytes missing)", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Stream a reader into the accumulator in fixed-size chunks
pub(crate) fn feed<R: Read>(
    acc: &mut ChecksumAccumulator,
    reader: &mut R,
    cancel: Option<&CancellationToken>,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(cancelled_io());
        }
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        acc.update(&buffer[..n]);
        total += n as u64;
    }
    Ok(total)
}

/// Computes the checksum of a manifest from the files on disk
#[derive(Clone, Default)]
pub struct ChecksumEngine {
    cancel: Option<CancellationToken>,
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for ChecksumEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumEngine")
            .field("cancel", &self.cancel.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl ChecksumEngine {
    /// Create an engine without cancellation or progress reporting
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop hashing once `token` fires
    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Report per-file progress
    pub fn with_progress(mut self, callback: Option<ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Compute the hex digest of `manifest`
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::Checksum`] if a file cannot be read or no longer
    ///   has the size recorded in the manifest; a partial digest is never
    ///   returned
    /// - [`ArchivistError::Cancelled`] if the token fires
    pub fn compute(&self, manifest: &Manifest) -> Result<String> {
        let start = Instant::now();
        let cancel = self.cancel.as_ref();
        let mut acc = ChecksumAccumulator::new();

        for (index, entry) in manifest.iter().enumerate() {
            check_cancelled(cancel)?;
            acc.begin_entry(&entry.archive_name, entry.size);

            let file = File::open(&entry.path).map_err(|e| ArchivistError::checksum(&entry.path, e))?;
            let mut reader = GuardedReader::new(file, entry.size, cancel);
            feed(&mut acc, &mut reader, cancel).map_err(|e| map_io(&entry.path, e))?;
            trace!("Hashed {} ({} bytes)", entry.archive_name, entry.size);

            if let Some(callback) = &self.progress {
                callback(ProgressInfo {
                    operation: "Hashing".to_string(),
                    current_item: Some(entry.archive_name.clone()),
                    processed: index + 1,
                    total: Some(manifest.len()),
                    bytes_processed: acc.bytes(),
                    total_bytes: Some(manifest.total_size),
                });
            }
        }

        let digest = acc.finish();
        debug!(
            "Checksum of {} files computed in {:?}: {}",
            manifest.len(),
            start.elapsed(),
            &digest[..16]
        );
        Ok(digest)
    }
}

fn map_io(path: &Path, err: io::Error) -> ArchivistError {
    if is_cancelled_io(&err) {
        ArchivistError::Cancelled
    } else {
        ArchivistError::checksum(path, err)
    }
}
