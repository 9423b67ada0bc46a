//! Integration tests for archivist
//!
//! Tests complete backup lifecycles: every container format, retention
//! through the manager, restores into populated directories and scheduled
//! runs.

use ::archivist::*;
use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;
use tracing_test::traced_test;

/// Test harness owning a source tree and a backup location
pub struct BackupTestHarness {
    pub source_dir: TempDir,
    pub backup_dir: TempDir,
    pub manager: BackupManager,
    pub file_generator: FileGenerator,
}

impl BackupTestHarness {
    /// Create a new test harness
    pub fn new() -> Self {
        let source_dir = TempDir::new().unwrap();
        let backup_dir = TempDir::new().unwrap();
        let manager = BackupManager::open(backup_dir.path()).unwrap();

        Self {
            source_dir,
            backup_dir,
            manager,
            file_generator: FileGenerator::new(42),
        }
    }

    /// Configuration backing up the whole source tree
    pub fn config(&self, compression: CompressionType, retention: Retention) -> BackupConfiguration {
        BackupConfiguration::builder()
            .source_path(self.source_dir.path())
            .backup_location(self.backup_dir.path())
            .compression(compression)
            .retention(retention)
            .build()
            .unwrap()
    }

    /// Populate the source with a small project layout
    pub fn generate_project(&mut self, files_per_dir: usize) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut written = BTreeMap::new();
        for dir in ["src", "src/nested", "docs", "assets"] {
            fs::create_dir_all(self.source_dir.path().join(dir)).unwrap();
            for i in 0..files_per_dir {
                let relative = PathBuf::from(dir).join(format!("file_{}.dat", i));
                let content = self.file_generator.content(i * 97 + 1);
                fs::write(self.source_dir.path().join(&relative), &content).unwrap();
                written.insert(relative, content);
            }
        }
        written
    }

    /// Directory a restore into `target` places this source under
    pub fn restored_root(&self, target: &Path) -> PathBuf {
        target.join(self.source_dir.path().file_name().unwrap())
    }

    /// Shift a record's timestamp into the past
    pub fn age_record(&self, backup_id: &str, days: i64) {
        self.manager
            .store()
            .update(backup_id, |r| r.timestamp = Utc::now() - ChronoDuration::days(days))
            .unwrap();
    }
}

/// Deterministic file content generator
pub struct FileGenerator {
    rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Mix of text-like and binary bytes
    pub fn content(&mut self, size: usize) -> Vec<u8> {
        if self.rng.random_bool(0.5) {
            (0..size)
                .map(|_| self.rng.random_range(b'a'..=b'z'))
                .collect()
        } else {
            (0..size).map(|_| self.rng.random()).collect()
        }
    }
}

fn assert_tree_matches(root: &Path, expected: &BTreeMap<PathBuf, Vec<u8>>) {
    for (relative, content) in expected {
        let restored = fs::read(root.join(relative))
            .unwrap_or_else(|e| panic!("missing {:?}: {}", relative, e));
        assert_eq!(&restored, content, "content differs for {:?}", relative);
    }
}

#[test]
fn test_lifecycle_for_every_format() {
    let mut harness = BackupTestHarness::new();
    let expected = harness.generate_project(5);
    let mut checksums = Vec::new();

    for (i, compression) in CompressionType::ALL.iter().enumerate() {
        let config = harness.config(*compression, Retention::Indefinite);
        let id = format!("format_{}", i);
        let record = harness.manager.create_backup(Some(id.clone()), &config).unwrap();

        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.total_files, expected.len());
        assert_eq!(record.compression_type, *compression);
        assert!(record.artifact_size_bytes > 0);
        assert!(record.error_message.is_none());

        let artifact = record.artifact_path(harness.backup_dir.path());
        assert!(artifact.exists());
        assert!(artifact.to_string_lossy().ends_with(compression.extension()));

        let verification = harness.manager.verify_backup(&id).unwrap();
        assert!(verification.ok, "{}", verification.summary());

        let target = TempDir::new().unwrap();
        let result = harness.manager.restore_backup(&id, target.path()).unwrap();
        assert_eq!(result.restored_files.len(), expected.len());
        assert!(result.error.is_none());
        assert_tree_matches(&harness.restored_root(target.path()), &expected);

        checksums.push(record.checksum);
    }

    // The checksum covers content, not the container
    checksums.dedup();
    assert_eq!(checksums.len(), 1);
    assert_eq!(harness.manager.stats().completed, CompressionType::ALL.len());
}

#[test]
fn test_restore_into_populated_directory() {
    let mut harness = BackupTestHarness::new();
    let expected = harness.generate_project(2);
    let config = harness.config(CompressionType::Zip, Retention::Indefinite);
    let record = harness.manager.create_backup(None, &config).unwrap();

    let target = TempDir::new().unwrap();
    let root = harness.restored_root(target.path());
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/file_0.dat"), b"local edits").unwrap();
    fs::write(target.path().join("unrelated.txt"), b"keep me").unwrap();

    let result = harness
        .manager
        .restore_backup(&record.backup_id, target.path())
        .unwrap();
    assert_eq!(result.restored_files.len(), expected.len() - 1);
    assert_eq!(result.skipped_files.len(), 1);
    assert_eq!(fs::read(root.join("src/file_0.dat")).unwrap(), b"local edits");
    assert_eq!(fs::read(target.path().join("unrelated.txt")).unwrap(), b"keep me");

    let options = RestoreOptions {
        overwrite_existing: true,
        ..Default::default()
    };
    let result = harness
        .manager
        .restore_backup_with_options(&record.backup_id, target.path(), &options)
        .unwrap();
    assert_eq!(result.restored_files.len(), expected.len());
    assert_tree_matches(&root, &expected);
    assert_eq!(fs::read(target.path().join("unrelated.txt")).unwrap(), b"keep me");
}

#[test]
fn test_retention_through_manager() {
    let mut harness = BackupTestHarness::new();
    harness.generate_project(1);
    let keep_all = harness.config(CompressionType::TarGz, Retention::Indefinite);

    for (name, age) in [("old", 40), ("middle", 20), ("recent", 5)] {
        let record = harness
            .manager
            .create_backup(Some(name.to_string()), &keep_all)
            .unwrap();
        harness.age_record(&record.backup_id, age);
    }

    let thirty_days = harness.config(CompressionType::TarGz, Retention::Days(30));
    let preview = harness.manager.preview_retention(&thirty_days).unwrap();
    assert_eq!(preview.len(), 1);
    assert_eq!(preview[0].backup_id, "old");

    let old_artifact = preview[0].artifact_path(harness.backup_dir.path());
    let report = harness.manager.sweep_retention(&thirty_days).unwrap();
    assert_eq!(report.deleted, vec!["old".to_string()]);
    assert!(report.failures.is_empty());
    assert!(report.bytes_reclaimed > 0);
    assert!(!old_artifact.exists());

    let remaining: Vec<String> = harness
        .manager
        .list_backups()
        .unwrap()
        .into_iter()
        .map(|r| r.backup_id)
        .collect();
    assert_eq!(remaining, vec!["middle".to_string(), "recent".to_string()]);

    // A run with the shorter horizon expires the next record on its own
    harness
        .manager
        .create_backup(Some("fresh".into()), &harness.config(CompressionType::TarGz, Retention::Days(10)))
        .unwrap();
    let remaining: Vec<String> = harness
        .manager
        .list_backups()
        .unwrap()
        .into_iter()
        .map(|r| r.backup_id)
        .collect();
    assert_eq!(remaining, vec!["recent".to_string(), "fresh".to_string()]);
}

#[test]
#[traced_test]
fn test_failed_run_is_recorded_and_logged() {
    let harness = BackupTestHarness::new();
    fs::write(harness.source_dir.path().join("a.txt"), b"a").unwrap();
    let config = harness.config(CompressionType::Tar, Retention::Indefinite);

    // Cancelled from the first progress report, after the record exists
    let token = CancellationToken::new();
    let cancel_on_progress = token.clone();
    let options = BackupOptions {
        backup_id: Some("doomed".into()),
        cancellation: Some(token),
        progress_callback: Some(Arc::new(move |_info: ProgressInfo| cancel_on_progress.cancel())),
    };
    let err = harness
        .manager
        .create_backup_with_options(&config, options)
        .unwrap_err();
    assert!(err.is_cancelled());

    let record = harness.manager.get_backup_status("doomed").unwrap();
    assert_eq!(record.status, BackupStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some(manager::CANCELLED_MESSAGE));
    assert!(!record.artifact_path(harness.backup_dir.path()).exists());
    assert!(logs_contain("doomed"));

    // A run cancelled before it starts leaves nothing behind
    let token = CancellationToken::new();
    token.cancel();
    let options = BackupOptions {
        backup_id: Some("never".into()),
        cancellation: Some(token),
        progress_callback: None,
    };
    assert!(harness
        .manager
        .create_backup_with_options(&config, options)
        .unwrap_err()
        .is_cancelled());
    assert!(harness.manager.get_backup_status("never").is_err());
}

#[test]
#[traced_test]
fn test_reopen_recovers_interrupted_run() {
    let harness = BackupTestHarness::new();
    fs::write(harness.source_dir.path().join("a.txt"), b"a").unwrap();
    let config = harness.config(CompressionType::TarGz, Retention::Indefinite);

    let record = BackupRecord::pending("crashed", &config);
    harness.manager.store().put(record).unwrap();
    harness
        .manager
        .store()
        .update("crashed", |r| r.status = BackupStatus::InProgress)
        .unwrap();
    // Leftover staging file from the interrupted writer
    let staging = harness
        .backup_dir
        .path()
        .join(format!("{}crashed.tar.gz", utils::STAGING_PREFIX));
    fs::write(&staging, b"partial").unwrap();

    // The crashed process no longer holds the location
    let BackupTestHarness {
        manager,
        backup_dir,
        source_dir: _source_dir,
        ..
    } = harness;
    drop(manager);

    let reopened = BackupManager::open(backup_dir.path()).unwrap();
    let recovered = reopened.get_backup_status("crashed").unwrap();
    assert_eq!(recovered.status, BackupStatus::Failed);
    assert!(recovered.error_message.is_some());
    assert!(logs_contain("crashed"));
    assert!(!staging.exists());

    // New runs still work against the recovered registry
    let fresh = reopened.create_backup(None, &config).unwrap();
    assert_eq!(fresh.status, BackupStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn test_scheduled_backups_restore() {
    let harness = BackupTestHarness::new();
    fs::write(harness.source_dir.path().join("state.txt"), b"v1").unwrap();
    let config = harness.config(CompressionType::TarBz2, Retention::Indefinite);

    let manager = Arc::new(BackupManager::open(harness.backup_dir.path()).unwrap());
    let scheduler = Scheduler::new(Arc::clone(&manager));
    let handle = scheduler
        .schedule(config, Cadence::every(Duration::from_millis(150)).unwrap())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.shutdown();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats = handle.stats();
    info!("Schedule stats: {:?}", stats);
    assert!(stats.completed >= 1, "{:?}", stats);
    assert_eq!(stats.failed, 0);
    assert!(handle.is_cancelled());
    assert_eq!(scheduler.active_schedules(), 0);

    let records = manager.list_backups().unwrap();
    assert_eq!(records.len() as u64, stats.completed);
    // Ids generated within the same second stay unique
    let ids: std::collections::HashSet<&str> =
        records.iter().map(|r| r.backup_id.as_str()).collect();
    assert_eq!(ids.len(), records.len());

    let last = handle.last_backup_id().unwrap();
    let target = TempDir::new().unwrap();
    let manager_for_restore = Arc::clone(&manager);
    let target_path = target.path().to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        manager_for_restore.restore_backup(&last, &target_path)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.restored_files.len(), 1);
    assert_eq!(
        fs::read(harness.restored_root(target.path()).join("state.txt")).unwrap(),
        b"v1"
    );
    handle.stopped().await;
}
