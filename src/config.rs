//! Backup configuration
//!
//! A [`BackupConfiguration`] is the immutable input of one backup run. It is
//! a plain serde value so that any config-loading collaborator can produce it;
//! the host binary reads it from a JSON file.
//!
//! ## Example
//!
//! ```rust
//! use archivist::{BackupConfiguration, CompressionType, Retention};
//!
//! let config = BackupConfiguration::builder()
//!     .source_path("/srv/projects")
//!     .backup_location("/var/backups/projects")
//!     .retention(Retention::Days(30))
//!     .compression(CompressionType::TarGz)
//!     .exclude_pattern("*.tmp")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.source_paths.len(), 1);
//! ```

use crate::error::{ArchivistError, Result};
use crate::types::CompressionType;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Default per-file ceiling (100 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default retention horizon in days
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// How long completed backups are kept
///
/// Serialized as a day count or the string `"indefinite"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RetentionRepr", into = "RetentionRepr")]
pub enum Retention {
    /// Delete completed backups older than this many days (at least 1)
    Days(u32),
    /// Never delete automatically
    Indefinite,
}

impl Default for Retention {
    fn default() -> Self {
        Retention::Days(DEFAULT_RETENTION_DAYS)
    }
}

impl Retention {
    /// Horizon as a duration, `None` for indefinite retention
    pub fn horizon(&self) -> Option<chrono::Duration> {
        match self {
            Retention::Days(days) => Some(chrono::Duration::days(i64::from(*days))),
            Retention::Indefinite => None,
        }
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retention::Days(days) => write!(f, "{} days", days),
            Retention::Indefinite => f.write_str("indefinite"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetentionRepr {
    Days(u32),
    Keyword(String),
}

impl TryFrom<RetentionRepr> for Retention {
    type Error = String;

    fn try_from(repr: RetentionRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            RetentionRepr::Days(days) => Ok(Retention::Days(days)),
            RetentionRepr::Keyword(word) if word.eq_ignore_ascii_case("indefinite") => {
                Ok(Retention::Indefinite)
            }
            RetentionRepr::Keyword(word) => Err(format!(
                "invalid retention '{}': expected a number of days or \"indefinite\"",
                word
            )),
        }
    }
}

impl From<Retention> for RetentionRepr {
    fn from(retention: Retention) -> Self {
        match retention {
            Retention::Days(days) => RetentionRepr::Days(days),
            Retention::Indefinite => RetentionRepr::Keyword("indefinite".to_string()),
        }
    }
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_exclude_patterns() -> Vec<String> {
    [".git", "__pycache__", "*.pyc", "node_modules", ".DS_Store"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

/// Input of one backup run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfiguration {
    /// Root paths to include, in order
    pub source_paths: Vec<PathBuf>,
    /// Directory holding artifacts and the metadata registry
    pub backup_location: PathBuf,
    /// Retention horizon for completed backups
    #[serde(default)]
    pub retention_days: Retention,
    /// Artifact format
    #[serde(default)]
    pub compression_type: CompressionType,
    /// Files larger than this are skipped
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Glob patterns matched against relative paths and file names
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// Include dotfiles and dot-directories
    #[serde(default)]
    pub include_hidden: bool,
}

impl BackupConfiguration {
    /// Start building a configuration
    pub fn builder() -> BackupConfigurationBuilder {
        BackupConfigurationBuilder::new()
    }

    /// Check every field
    ///
    /// # Errors
    ///
    /// Returns [`ArchivistError::Configuration`] for an empty or duplicated
    /// source list, an empty backup location, a zero size ceiling, zero-day
    /// retention, or an exclude pattern that does not compile.
    pub fn validate(&self) -> Result<()> {
        if self.source_paths.is_empty() {
            return Err(ArchivistError::configuration("source_paths must not be empty"));
        }

        let mut seen = HashSet::new();
        for path in &self.source_paths {
            if path.as_os_str().is_empty() {
                return Err(ArchivistError::configuration("source_paths contains an empty path"));
            }
            if !seen.insert(path) {
                return Err(ArchivistError::configuration(format!(
                    "source path {:?} is listed twice",
                    path
                )));
            }
        }

        if self.backup_location.as_os_str().is_empty() {
            return Err(ArchivistError::configuration("backup_location must not be empty"));
        }

        if self.max_file_size_bytes == 0 {
            return Err(ArchivistError::configuration(
                "max_file_size_bytes must be greater than zero",
            ));
        }

        if self.retention_days == Retention::Days(0) {
            return Err(ArchivistError::configuration(
                "retention_days must be at least 1; use \"indefinite\" to keep backups forever",
            ));
        }

        self.exclude_globset().map_err(|e| {
            ArchivistError::configuration(format!("invalid exclude pattern: {}", e))
        })?;

        Ok(())
    }

    /// Compile the exclude patterns
    pub fn exclude_globset(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude_patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(builder.build()?)
    }

    /// Stable identity of this configuration
    ///
    /// Derived from the source paths and the backup location only, so changing
    /// retention or compression does not create a second run lock for the same
    /// data.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for path in &self.source_paths {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0xffu8]);
        hasher.update(self.backup_location.to_string_lossy().as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: BackupConfiguration = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as pretty JSON
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        crate::utils::atomic_write(path, json.as_bytes())
    }
}

/// Builder for [`BackupConfiguration`]
#[derive(Debug, Clone)]
pub struct BackupConfigurationBuilder {
    source_paths: Vec<PathBuf>,
    backup_location: Option<PathBuf>,
    retention: Retention,
    compression: CompressionType,
    max_file_size: u64,
    exclude_patterns: Vec<String>,
    include_hidden: bool,
}

impl BackupConfigurationBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            source_paths: Vec::new(),
            backup_location: None,
            retention: Retention::default(),
            compression: CompressionType::default(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            exclude_patterns: default_exclude_patterns(),
            include_hidden: false,
        }
    }

    /// Add a source root
    pub fn source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_paths.push(path.into());
        self
    }

    /// Replace all source roots
    pub fn source_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.source_paths = paths;
        self
    }

    /// Set the directory that receives artifacts and the registry
    pub fn backup_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_location = Some(path.into());
        self
    }

    /// Set the retention horizon
    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Set the artifact format
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Set the per-file ceiling in bytes
    ///
    /// ```rust
    /// use archivist::BackupConfiguration;
    ///
    /// let builder = BackupConfiguration::builder()
    ///     .max_file_size(10 * 1024 * 1024); // Skip files larger than 10MB
    /// ```
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Add one exclude pattern to the defaults
    pub fn exclude_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Replace the exclude patterns, dropping the defaults
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Include dotfiles
    pub fn include_hidden(mut self, include: bool) -> Self {
        self.include_hidden = include;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<BackupConfiguration> {
        let backup_location = self
            .backup_location
            .ok_or_else(|| ArchivistError::configuration("backup_location is required"))?;

        let config = BackupConfiguration {
            source_paths: self.source_paths,
            backup_location,
            retention_days: self.retention,
            compression_type: self.compression,
            max_file_size_bytes: self.max_file_size,
            exclude_patterns: self.exclude_patterns,
            include_hidden: self.include_hidden,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for BackupConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
