//! Property-based testing for archivist
//!
//! Uses proptest to verify invariants across randomly generated source
//! trees and registries.

use ::archivist::*;
use chrono::{Duration as ChronoDuration, Utc};
use filetime::FileTime;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Generate random relative file paths
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    let dir_strategy = prop::collection::vec(
        prop_oneof!["[a-z]{1,8}", "dir[0-9]{1,2}"],
        0..=3,
    );
    let filename_strategy = prop_oneof![
        "file[0-9]{1,3}\\.txt",
        "[a-z]{1,8}\\.(txt|rs|md)",
        "[a-z]{3,10}",
    ];

    (dir_strategy, filename_strategy).prop_map(|(dirs, filename)| {
        let mut path = PathBuf::new();
        for dir in dirs {
            path.push(dir);
        }
        path.join(filename)
    })
}

/// Generate random file content, including empty files
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        "[a-zA-Z0-9 \n]{0,500}".prop_map(|s| s.into_bytes()),
        prop::collection::vec(any::<u8>(), 0..20_000),
        (any::<u8>(), 1..9000usize).prop_map(|(byte, count)| vec![byte; count]),
    ]
}

fn tree_strategy() -> impl Strategy<Value = Vec<(PathBuf, Vec<u8>)>> {
    prop::collection::vec((path_strategy(), content_strategy()), 1..16)
}

fn compression_strategy() -> impl Strategy<Value = CompressionType> {
    prop::sample::select(CompressionType::ALL.to_vec())
}

/// Write `files` under `root`, skipping paths that clash with earlier ones
///
/// Returns what actually ended up on disk.
fn write_tree<'a, I>(root: &Path, files: I) -> BTreeMap<PathBuf, Vec<u8>>
where
    I: IntoIterator<Item = &'a (PathBuf, Vec<u8>)>,
{
    let mut written = BTreeMap::new();
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                continue;
            }
        }
        if fs::write(&path, content).is_ok() {
            written.insert(relative.clone(), content.clone());
        }
    }
    written
}

fn checksum_of(root: &Path) -> String {
    let collection = FileCollector::new().collect(&[root.to_path_buf()]).unwrap();
    ChecksumEngine::new().compute(&collection.manifest).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Backup then restore reproduces every file byte for byte
    #[test]
    fn prop_backup_restore_roundtrip(
        files in tree_strategy(),
        compression in compression_strategy(),
    ) {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let root = source.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        let written = write_tree(&root, &files);
        prop_assume!(!written.is_empty());

        let config = BackupConfiguration::builder()
            .source_path(&root)
            .backup_location(backups.path())
            .compression(compression)
            .build()
            .unwrap();
        let manager = BackupManager::for_config(&config).unwrap();
        let record = manager.create_backup(None, &config).unwrap();

        prop_assert_eq!(record.status, BackupStatus::Completed);
        prop_assert_eq!(record.total_files, written.len());
        prop_assert_eq!(
            record.total_size_bytes,
            written.values().map(|c| c.len() as u64).sum::<u64>()
        );
        prop_assert_eq!(&record.checksum, &checksum_of(&root));

        let result = manager.restore_backup(&record.backup_id, target.path()).unwrap();
        prop_assert_eq!(result.restored_files.len(), written.len());
        for (relative, content) in &written {
            let restored = fs::read(target.path().join("tree").join(relative)).unwrap();
            prop_assert_eq!(&restored, content);
        }
    }

    /// The checksum ignores creation order and timestamps
    #[test]
    fn prop_checksum_is_deterministic(
        files in tree_strategy(),
        mtime_secs in 0i64..2_000_000_000,
    ) {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let root_a = first.path().join("tree");
        let root_b = second.path().join("tree");
        fs::create_dir_all(&root_a).unwrap();
        fs::create_dir_all(&root_b).unwrap();

        let written = write_tree(&root_a, &files);
        prop_assume!(!written.is_empty());
        // Same final tree written in a different order
        for (relative, content) in written.iter().rev() {
            let path = root_b.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
        }

        prop_assert_eq!(checksum_of(&root_a), checksum_of(&root_b));
    }

    /// Any single-byte change is visible in the checksum
    #[test]
    fn prop_checksum_detects_content_change(
        files in tree_strategy(),
        pick in any::<prop::sample::Index>(),
        offset in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let source = TempDir::new().unwrap();
        let root = source.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        let written = write_tree(&root, &files);
        let non_empty: Vec<(&PathBuf, &Vec<u8>)> =
            written.iter().filter(|(_, c)| !c.is_empty()).collect();
        prop_assume!(!non_empty.is_empty());

        let before = checksum_of(&root);
        let (relative, content) = non_empty[pick.index(non_empty.len())];
        let mut mutated = content.clone();
        let at = offset.index(mutated.len());
        mutated[at] ^= mask;
        fs::write(root.join(relative), &mutated).unwrap();

        prop_assert_ne!(before, checksum_of(&root));
    }

    /// Manifests are strictly ordered by entry name and sizes add up
    #[test]
    fn prop_manifest_is_sorted(files in tree_strategy()) {
        let source = TempDir::new().unwrap();
        let root = source.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        let written = write_tree(&root, &files);
        prop_assume!(!written.is_empty());

        let collection = FileCollector::new().collect(&[root.clone()]).unwrap();
        let manifest = &collection.manifest;
        prop_assert_eq!(manifest.len(), written.len());
        for pair in manifest.entries.windows(2) {
            prop_assert!(pair[0].archive_name < pair[1].archive_name);
        }
        prop_assert_eq!(
            manifest.total_size,
            manifest.iter().map(|e| e.size).sum::<u64>()
        );
        for entry in manifest.iter() {
            prop_assert!(entry.archive_name.starts_with("tree/"));
            prop_assert!(!entry.archive_name.contains('\\'));
        }
    }
}

fn status_strategy() -> impl Strategy<Value = BackupStatus> {
    prop::sample::select(vec![
        BackupStatus::Pending,
        BackupStatus::InProgress,
        BackupStatus::Completed,
        BackupStatus::Failed,
        BackupStatus::Corrupted,
    ])
}

/// Drive a pending record to `status` through legal transitions
fn advance(store: &MetadataStore, backup_id: &str, status: BackupStatus) {
    let path: &[BackupStatus] = match status {
        BackupStatus::Pending => &[],
        BackupStatus::InProgress => &[BackupStatus::InProgress],
        BackupStatus::Completed => &[BackupStatus::InProgress, BackupStatus::Completed],
        BackupStatus::Failed => &[BackupStatus::Failed],
        BackupStatus::Corrupted => &[
            BackupStatus::InProgress,
            BackupStatus::Completed,
            BackupStatus::Corrupted,
        ],
    };
    for next in path {
        store.update(backup_id, |r| r.status = *next).unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// Retention deletes exactly the completed records past the horizon
    #[test]
    fn prop_retention_deletes_only_expired_completed(
        records in prop::collection::vec((0i64..90, status_strategy()), 1..12),
        horizon in 1u32..60,
    ) {
        let location = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(location.path()).unwrap());
        let config = BackupConfiguration::builder()
            .source_path(location.path())
            .backup_location(location.path())
            .build()
            .unwrap();

        let now = Utc::now();
        let mut expected_deleted = Vec::new();
        for (i, (age_days, status)) in records.iter().enumerate() {
            let id = format!("record_{:02}", i);
            let mut record = BackupRecord::pending(&id, &config);
            // Half a day past the whole-day age keeps clear of the boundary
            record.timestamp = now - ChronoDuration::days(*age_days) - ChronoDuration::hours(12);
            store.put(record).unwrap();
            advance(&store, &id, *status);
            if *status == BackupStatus::Completed && *age_days >= i64::from(horizon) {
                expected_deleted.push(id);
            }
        }

        let retention = RetentionManager::new(Arc::clone(&store));
        let report = retention.sweep(now, Retention::Days(horizon)).unwrap();

        let mut deleted = report.deleted.clone();
        deleted.sort();
        prop_assert_eq!(&deleted, &expected_deleted);
        prop_assert!(report.failures.is_empty());
        prop_assert_eq!(store.list().len(), records.len() - expected_deleted.len());
        for id in &expected_deleted {
            prop_assert!(!store.contains(id));
        }

        // Indefinite retention never deletes anything
        let report = retention.sweep(now, Retention::Indefinite).unwrap();
        prop_assert!(report.deleted.is_empty());
    }
}
