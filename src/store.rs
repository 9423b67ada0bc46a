//! Durable registry of backup records
//!
//! The [`MetadataStore`] owns the one registry file under a backup location
//! and every [`BackupRecord`] in it. It is created explicitly for a location
//! and shared through `Arc` by the manager, the retention manager and the
//! restore engine; there is no process-wide registry.
//!
//! ## Layout
//!
//! ```text
//! backup_location/
//! ├── backup_registry.json        # all records, pretty JSON
//! ├── backup_20240101_020000.tar.gz
//! └── nightly-7.zip
//! ```
//!
//! ## Consistency
//!
//! Several stores, in this process or others, may have one location open.
//! Every mutation takes the registry lock file, re-reads the registry, applies
//! its change, writes the result to a staging file and renames it over the
//! registry, so no instance overwrites records another one wrote. Reads
//! reload the registry first. A failed write leaves both the file and the
//! in-memory view unchanged, so [`MetadataStore::list`] reflects exactly the
//! calls that returned success.
//!
//! ## Record Claims
//!
//! Restores and deletions coordinate through short-lived claims. Any number
//! of restores may hold a record at once; a deletion needs it exclusively.
//! A claim is released when its [`RecordClaim`] guard is dropped. Claims live
//! in memory and only coordinate callers sharing one store.

use crate::error::{ArchivistError, Result};
use crate::locks::{LockFile, INSTANCE_LOCK_FILE, REGISTRY_LOCK_FILE};
use crate::types::{BackupRecord, BackupStatus, StoreStats};
use crate::utils;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Registry file name under the backup location
pub const REGISTRY_FILE: &str = "backup_registry.json";

/// Current registry format version
const FORMAT_VERSION: u32 = 1;

/// Error text stored on records whose run died before finishing
pub const INTERRUPTED_MESSAGE: &str = "interrupted: the process exited before the backup finished";

/// On-disk registry
#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    format_version: u32,
    archivist_version: String,
    updated_at: DateTime<Utc>,
    records: Vec<BackupRecord>,
}

/// What a claim protects a record against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// Record is being read for a restore; deletion must wait
    Restore,
    /// Record is being deleted; restores must not start
    Delete,
}

#[derive(Debug)]
struct Claim {
    kind: ClaimKind,
    holders: usize,
}

/// Guard for a claimed record; releases the claim on drop
#[derive(Debug)]
pub struct RecordClaim<'a> {
    store: &'a MetadataStore,
    backup_id: String,
    kind: ClaimKind,
}

impl RecordClaim<'_> {
    /// Claimed record
    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    /// Kind of claim held
    pub fn kind(&self) -> ClaimKind {
        self.kind
    }
}

impl Drop for RecordClaim<'_> {
    fn drop(&mut self) {
        self.store.release(&self.backup_id);
    }
}

/// Registry of backup records for one backup location
pub struct MetadataStore {
    location: PathBuf,
    registry_path: PathBuf,
    /// Last registry contents this instance read or wrote
    records: RwLock<BTreeMap<String, BackupRecord>>,
    /// Held exclusively across read-modify-write of the registry
    registry_lock: LockFile,
    /// Held shared for the lifetime of the store
    _instance_lock: LockFile,
    claims: DashMap<String, Claim>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("location", &self.location)
            .field("records", &self.records.read().len())
            .field("claims", &self.claims.len())
            .finish()
    }
}

impl MetadataStore {
    /// Open the registry under `location`, creating the directory if needed
    ///
    /// A missing registry file means an empty store; the file is written on
    /// the first mutation. When no other instance has the location open,
    /// staging files left by an interrupted writer are removed.
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::Io`] if the directory cannot be created or the
    ///   registry cannot be read
    /// - [`ArchivistError::Json`] if the registry is not valid JSON
    /// - [`ArchivistError::Internal`] if the registry was written by a newer
    ///   format version, or the location cannot be locked
    pub fn open(location: impl Into<PathBuf>) -> Result<Self> {
        let location = location.into();
        fs::create_dir_all(&location)?;
        let registry_path = location.join(REGISTRY_FILE);
        let instance_lock = LockFile::open(location.join(INSTANCE_LOCK_FILE))?;
        let registry_lock = LockFile::open(location.join(REGISTRY_LOCK_FILE))?;

        // Alone in the location: nobody can be writing, so staging files are stale
        if instance_lock.try_lock_exclusive()? {
            match utils::remove_stale_staging(&location) {
                Ok(removed) if !removed.is_empty() => {
                    info!("Removed {} stale staging file(s)", removed.len());
                }
                Ok(_) => {}
                Err(e) => warn!("Could not scan {:?} for staging files: {}", location, e),
            }
            instance_lock.unlock()?;
        } else {
            debug!("Backup location {:?} is shared with another instance", location);
        }
        instance_lock.lock_shared()?;

        let records = read_registry(&registry_path)?;
        info!("Opened metadata store at {:?} ({} records)", location, records.len());
        Ok(Self {
            location,
            registry_path,
            records: RwLock::new(records),
            registry_lock,
            _instance_lock: instance_lock,
            claims: DashMap::new(),
        })
    }

    /// Backup location this store manages
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Path of the registry file
    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Reload the registry so records written by other instances show up
    pub fn refresh(&self) -> Result<()> {
        let mut records = self.records.write();
        *records = read_registry(&self.registry_path)?;
        Ok(())
    }

    /// Current records, falling back to the last known ones if the registry
    /// cannot be read
    fn view(&self) -> RwLockReadGuard<'_, BTreeMap<String, BackupRecord>> {
        if let Err(e) = self.refresh() {
            warn!(
                "Could not reload {:?}, using cached records: {}",
                self.registry_path, e
            );
        }
        self.records.read()
    }

    /// Apply `change` to the registry on disk under the registry lock
    ///
    /// The change sees every record written so far by any instance. Nothing
    /// is written or published if it fails.
    fn mutate<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut BTreeMap<String, BackupRecord>) -> Result<T>,
    {
        let mut records = self.records.write();
        let _registry = self.registry_lock.exclusive()?;

        let mut next = read_registry(&self.registry_path)?;
        let value = change(&mut next)?;
        self.persist(&next)?;
        *records = next;
        Ok(value)
    }

    /// Insert a new record
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::DuplicateBackupId`] if the id is taken
    pub fn put(&self, record: BackupRecord) -> Result<()> {
        let id = record.backup_id.clone();
        self.mutate(|records| {
            if records.contains_key(&record.backup_id) {
                return Err(ArchivistError::DuplicateBackupId(record.backup_id));
            }
            records.insert(record.backup_id.clone(), record);
            Ok(())
        })?;

        debug!("Stored backup record {}", id);
        Ok(())
    }

    /// Insert a new record, renaming it with a numeric suffix if its id is taken
    ///
    /// An id also counts as taken when a file already sits at its artifact
    /// path. Returns the record as stored.
    pub fn put_with_unique_id(&self, mut record: BackupRecord) -> Result<BackupRecord> {
        let base = record.backup_id.clone();
        let record = self.mutate(|records| {
            let mut suffix = 1;
            while records.contains_key(&record.backup_id)
                || record.artifact_path(&self.location).exists()
            {
                record.backup_id = format!("{}_{}", base, suffix);
                suffix += 1;
            }
            records.insert(record.backup_id.clone(), record.clone());
            Ok(record)
        })?;

        if record.backup_id != base {
            debug!("Backup id {} taken, using {}", base, record.backup_id);
        }
        debug!("Stored backup record {}", record.backup_id);
        Ok(record)
    }

    /// Get a record
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::NotFound`] if no record has this id
    pub fn get(&self, backup_id: &str) -> Result<BackupRecord> {
        self.view()
            .get(backup_id)
            .cloned()
            .ok_or_else(|| ArchivistError::NotFound(backup_id.to_string()))
    }

    /// Check whether a record exists
    pub fn contains(&self, backup_id: &str) -> bool {
        self.view().contains_key(backup_id)
    }

    /// All records, oldest first
    pub fn list(&self) -> Vec<BackupRecord> {
        sorted(&self.view())
    }

    /// All records, oldest first, failing if the registry cannot be reloaded
    ///
    /// Use this where acting on a stale view would destroy data.
    pub fn try_list(&self) -> Result<Vec<BackupRecord>> {
        self.refresh()?;
        Ok(sorted(&self.records.read()))
    }

    /// Update a record in place
    ///
    /// The closure may change any field except `backup_id`. A status change
    /// must follow the record lifecycle.
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::NotFound`] if no record has this id
    /// - [`ArchivistError::InvalidTransition`] for a non-monotonic status change
    pub fn update<F>(&self, backup_id: &str, updater: F) -> Result<BackupRecord>
    where
        F: FnOnce(&mut BackupRecord),
    {
        let updated = self.mutate(|records| {
            let current = records
                .get(backup_id)
                .ok_or_else(|| ArchivistError::NotFound(backup_id.to_string()))?;
            let from = current.status;

            let mut updated = current.clone();
            updater(&mut updated);
            updated.backup_id = backup_id.to_string();

            if updated.status != from && !from.can_transition_to(updated.status) {
                return Err(ArchivistError::InvalidTransition {
                    backup_id: backup_id.to_string(),
                    from: from.to_string(),
                    to: updated.status.to_string(),
                });
            }
            records.insert(backup_id.to_string(), updated.clone());
            Ok(updated)
        })?;

        trace!("Updated backup record {} ({})", backup_id, updated.status);
        Ok(updated)
    }

    /// Remove a record
    ///
    /// Artifacts are not touched; callers delete them first.
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::NotFound`] if no record has this id
    pub fn delete(&self, backup_id: &str) -> Result<BackupRecord> {
        let removed = self.mutate(|records| {
            records
                .remove(backup_id)
                .ok_or_else(|| ArchivistError::NotFound(backup_id.to_string()))
        })?;

        debug!("Deleted backup record {}", backup_id);
        Ok(removed)
    }

    /// Mark a record left `pending` or `in_progress` by a dead run as failed
    ///
    /// The caller must make sure no live run owns the record. Returns `false`
    /// if the record had already finished.
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::NotFound`] if no record has this id
    pub fn mark_interrupted(&self, backup_id: &str) -> Result<bool> {
        if !self.get(backup_id)?.status.is_active() {
            return Ok(false);
        }

        let marked = self.mutate(|records| {
            let record = records
                .get_mut(backup_id)
                .ok_or_else(|| ArchivistError::NotFound(backup_id.to_string()))?;
            if !record.status.is_active() {
                return Ok(false);
            }
            record.status = BackupStatus::Failed;
            record.error_message = Some(INTERRUPTED_MESSAGE.to_string());
            Ok(true)
        })?;

        if marked {
            warn!("Marked interrupted backup {} as failed", backup_id);
        }
        Ok(marked)
    }

    /// Registry statistics
    pub fn stats(&self) -> StoreStats {
        let records = self.view();
        let mut stats = StoreStats {
            total_backups: records.len(),
            ..Default::default()
        };

        for record in records.values() {
            match record.status {
                BackupStatus::Pending => stats.pending += 1,
                BackupStatus::InProgress => stats.in_progress += 1,
                BackupStatus::Completed => {
                    stats.completed += 1;
                    stats.total_artifact_bytes += record.artifact_size_bytes;
                    stats.total_source_bytes += record.total_size_bytes;
                }
                BackupStatus::Failed => stats.failed += 1,
                BackupStatus::Corrupted => stats.corrupted += 1,
            }
            stats.oldest = Some(stats.oldest.map_or(record.timestamp, |t| t.min(record.timestamp)));
            stats.newest = Some(stats.newest.map_or(record.timestamp, |t| t.max(record.timestamp)));
        }
        stats
    }

    /// Claim a record for a restore or a deletion
    ///
    /// Restore claims are shared; a delete claim is exclusive.
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::InUse`] if a conflicting claim is held
    pub fn claim(&self, backup_id: &str, kind: ClaimKind) -> Result<RecordClaim<'_>> {
        match self.claims.entry(backup_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Claim { kind, holders: 1 });
            }
            Entry::Occupied(mut slot) => {
                let claim = slot.get_mut();
                if claim.kind == ClaimKind::Restore && kind == ClaimKind::Restore {
                    claim.holders += 1;
                } else {
                    return Err(ArchivistError::InUse(backup_id.to_string()));
                }
            }
        }

        trace!("Claimed {} for {:?}", backup_id, kind);
        Ok(RecordClaim {
            store: self,
            backup_id: backup_id.to_string(),
            kind,
        })
    }

    /// Check whether any claim is held on a record
    pub fn is_claimed(&self, backup_id: &str) -> bool {
        self.claims.contains_key(backup_id)
    }

    fn release(&self, backup_id: &str) {
        if let Entry::Occupied(mut slot) = self.claims.entry(backup_id.to_string()) {
            let claim = slot.get_mut();
            claim.holders = claim.holders.saturating_sub(1);
            if claim.holders == 0 {
                slot.remove();
            }
        }
    }

    fn persist(&self, records: &BTreeMap<String, BackupRecord>) -> Result<()> {
        let registry = RegistryFile {
            format_version: FORMAT_VERSION,
            archivist_version: env!("CARGO_PKG_VERSION").to_string(),
            updated_at: Utc::now(),
            records: records.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&registry)?;
        utils::atomic_write(&self.registry_path, json.as_bytes())
    }
}

/// Records in the registry file; a missing file is an empty registry
fn read_registry(path: &Path) -> Result<BTreeMap<String, BackupRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let registry: RegistryFile = serde_json::from_str(&content)?;
    if registry.format_version > FORMAT_VERSION {
        return Err(ArchivistError::internal(format!(
            "registry {:?} has format version {}, this build reads up to {}",
            path, registry.format_version, FORMAT_VERSION
        )));
    }
    Ok(registry
        .records
        .into_iter()
        .map(|record| (record.backup_id.clone(), record))
        .collect())
}

fn sorted(records: &BTreeMap<String, BackupRecord>) -> Vec<BackupRecord> {
    let mut records: Vec<BackupRecord> = records.values().cloned().collect();
    records.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.backup_id.cmp(&b.backup_id))
    });
    records
}
