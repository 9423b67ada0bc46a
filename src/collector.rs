//! File collection for backup runs
//!
//! The [`FileCollector`] walks the configured source roots and produces the
//! [`Manifest`] a run archives, together with the list of files it had to
//! leave out.
//!
//! ## Selection Rules
//!
//! A file is included when:
//! - no exclude pattern matches its path relative to its source root, nor its
//!   file name (a matching directory prunes its whole subtree)
//! - it is not hidden, or hidden files are enabled
//! - its size does not exceed the configured ceiling
//! - it is a regular file that can be opened
//!
//! Files failing the last two rules are recorded as [`SkippedFile`]s instead of
//! failing the run. Symbolic links are never followed.
//!
//! ## Archive Names
//!
//! Every source root contributes its entries under its base name, so
//! `/home/me/docs/a.txt` from the root `/home/me/docs` becomes `docs/a.txt`.
//! Roots sharing a base name get a `-N` suffix in configuration order. A root
//! that is a single file contributes one entry named after the file.
//!
//! The manifest is sorted by archive name, so the order never depends on how
//! the operating system happens to list a directory.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use archivist::collector::FileCollector;
//!
//! # fn example(config: &archivist::BackupConfiguration) -> archivist::Result<()> {
//! let collection = FileCollector::from_config(config)?.collect(&config.source_paths)?;
//! println!(
//!     "{} files selected, {} skipped",
//!     collection.manifest.len(),
//!     collection.skipped.len()
//! );
//! # Ok(())
//! # }
//! ```

use crate::config::{BackupConfiguration, DEFAULT_MAX_FILE_SIZE};
use crate::error::{ArchivistError, Result};
use crate::types::{FileEntry, Manifest, SkipReason, SkippedFile};
use crate::utils;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, trace, warn};
use walkdir::{DirEntry, WalkDir};

/// Files selected for a run plus everything that was skipped
#[derive(Debug, Clone)]
pub struct Collection {
    /// Sorted, non-empty manifest
    pub manifest: Manifest,
    /// Per-file skip reasons
    pub skipped: Vec<SkippedFile>,
}

/// Walks source roots and builds a manifest
#[derive(Debug, Clone)]
pub struct FileCollector {
    exclude: GlobSet,
    max_file_size: u64,
    include_hidden: bool,
    excluded_dirs: Vec<PathBuf>,
}

impl Default for FileCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCollector {
    /// Create a collector with no exclude patterns
    pub fn new() -> Self {
        Self {
            exclude: GlobSet::empty(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            include_hidden: false,
            excluded_dirs: Vec::new(),
        }
    }

    /// Create a collector from a run configuration
    ///
    /// The configuration's `backup_location` is excluded so a backup never
    /// archives its own artifacts.
    pub fn from_config(config: &BackupConfiguration) -> Result<Self> {
        let mut collector = Self::new()
            .with_exclude_set(config.exclude_globset()?)
            .with_max_file_size(config.max_file_size_bytes)
            .with_hidden(config.include_hidden);

        if let Ok(location) = fs::canonicalize(&config.backup_location) {
            collector = collector.with_excluded_dir(location);
        }
        Ok(collector)
    }

    /// Set compiled exclude patterns
    pub fn with_exclude_set(mut self, exclude: GlobSet) -> Self {
        self.exclude = exclude;
        self
    }

    /// Set the per-file ceiling
    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Include dotfiles
    pub fn with_hidden(mut self, include: bool) -> Self {
        self.include_hidden = include;
        self
    }

    /// Never descend into this directory
    pub fn with_excluded_dir(mut self, dir: PathBuf) -> Self {
        self.excluded_dirs.push(dir);
        self
    }

    /// Collect files from `sources`
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::SourceNotFound`] if a root does not exist
    /// - [`ArchivistError::EmptyManifest`] if no file survives filtering
    pub fn collect(&self, sources: &[PathBuf]) -> Result<Collection> {
        let mut roots = Vec::with_capacity(sources.len());
        for source in sources {
            match fs::canonicalize(source) {
                Ok(root) => roots.push(root),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(ArchivistError::SourceNotFound(source.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let labels = source_labels(&roots);
        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        for (root, label) in roots.iter().zip(labels.iter()) {
            let metadata = fs::metadata(root)?;
            if metadata.is_file() {
                let relative_path = PathBuf::from(label);
                let name = root.file_name().unwrap_or(root.as_os_str());
                if self.is_filtered(root, &relative_path, name) {
                    debug!("Source file {:?} is filtered out", root);
                } else {
                    self.consider_file(root, relative_path, &metadata, &mut entries, &mut skipped);
                }
                continue;
            }

            debug!("Scanning source root {:?} as '{}'", root, label);
            let walker = WalkDir::new(root)
                .follow_links(false)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| self.keep_entry(root, entry));

            for item in walker {
                let entry = match item {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                        warn!("Skipping unreadable path {:?}: {}", path, e);
                        skipped.push(SkippedFile::new(
                            path,
                            SkipReason::Unreadable {
                                message: e.to_string(),
                            },
                        ));
                        continue;
                    }
                };

                let file_type = entry.file_type();
                if file_type.is_dir() {
                    continue;
                }

                let inner = entry.path().strip_prefix(root).unwrap_or(entry.path());
                let relative_path = Path::new(label).join(inner);

                if !file_type.is_file() {
                    trace!("Skipping non-regular file {:?}", entry.path());
                    skipped.push(SkippedFile::new(entry.path(), SkipReason::NotRegularFile));
                    continue;
                }

                match entry.metadata() {
                    Ok(metadata) => self.consider_file(
                        entry.path(),
                        relative_path,
                        &metadata,
                        &mut entries,
                        &mut skipped,
                    ),
                    Err(e) => {
                        warn!("Cannot stat {:?}: {}", entry.path(), e);
                        skipped.push(SkippedFile::new(
                            entry.path(),
                            SkipReason::Unreadable {
                                message: e.to_string(),
                            },
                        ));
                    }
                }
            }
        }

        let manifest = Manifest::new(entries);
        if manifest.is_empty() {
            return Err(ArchivistError::EmptyManifest(sources.len()));
        }

        info!(
            "Collected {} files ({}) from {} source(s), {} skipped",
            manifest.len(),
            utils::format_bytes(manifest.total_size),
            sources.len(),
            skipped.len()
        );

        Ok(Collection { manifest, skipped })
    }

    /// Filter applied while walking; returning false prunes directories
    fn keep_entry(&self, root: &Path, entry: &DirEntry) -> bool {
        // walkdir applies the filter to the root too, even below min_depth
        if entry.depth() == 0 {
            return true;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        !self.is_filtered(path, relative, entry.file_name())
    }

    /// Location, hidden and exclude rules shared by walked entries and file roots
    fn is_filtered(&self, path: &Path, relative: &Path, name: &OsStr) -> bool {
        if self.excluded_dirs.iter().any(|dir| path.starts_with(dir)) {
            trace!("Skipping backup location {:?}", path);
            return true;
        }

        if !self.include_hidden && utils::is_hidden_name(name) {
            trace!("Skipping hidden entry {:?}", path);
            return true;
        }

        if self.exclude.is_match(relative) || self.exclude.is_match(name) {
            trace!("Excluded by pattern: {:?}", relative);
            return true;
        }

        false
    }

    fn consider_file(
        &self,
        path: &Path,
        relative_path: PathBuf,
        metadata: &fs::Metadata,
        entries: &mut Vec<FileEntry>,
        skipped: &mut Vec<SkippedFile>,
    ) {
        let size = metadata.len();
        if size > self.max_file_size {
            trace!("Skipping large file {:?} ({} bytes)", path, size);
            skipped.push(SkippedFile::new(
                path,
                SkipReason::TooLarge {
                    size,
                    limit: self.max_file_size,
                },
            ));
            return;
        }

        if let Err(e) = File::open(path) {
            warn!("Skipping unreadable file {:?}: {}", path, e);
            skipped.push(SkippedFile::new(
                path,
                SkipReason::Unreadable {
                    message: e.to_string(),
                },
            ));
            return;
        }

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(UNIX_EPOCH));

        entries.push(FileEntry {
            path: path.to_path_buf(),
            archive_name: utils::archive_name(&relative_path),
            relative_path,
            size,
            permissions: utils::get_permissions(metadata),
            modified,
        });
    }
}

/// Archive-root label for every source root, unique within the run
fn source_labels(roots: &[PathBuf]) -> Vec<String> {
    let mut used = HashSet::new();
    roots
        .iter()
        .map(|root| {
            let base = root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "root".to_string());

            let mut label = base.clone();
            let mut suffix = 1;
            while !used.insert(label.clone()) {
                label = format!("{}-{}", base, suffix);
                suffix += 1;
            }
            label
        })
        .collect()
}
