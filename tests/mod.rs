//! Main test module for archivist
//!
//! This module includes all test suites:
//! - Integration tests for complete backup lifecycles
//! - Chaos tests for corruption and concurrent access
//! - Property-based tests for invariants

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::archivist::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn config_for(sources: &[&Path], location: &Path) -> BackupConfiguration {
        BackupConfiguration::builder()
            .source_paths(sources.iter().map(|p| p.to_path_buf()).collect())
            .backup_location(location)
            .build()
            .unwrap()
    }

    #[test]
    fn test_special_filenames() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "file{with}braces.txt",
            "ünïcödé.txt",
        ];

        let mut written = Vec::new();
        for name in &special_names {
            let path = source.path().join(name);
            if fs::write(&path, format!("Content of {}", name)).is_ok() {
                written.push(*name);
            }
        }

        let config = config_for(&[source.path()], backups.path());
        let manager = BackupManager::for_config(&config).unwrap();
        let record = manager.create_backup(None, &config).unwrap();
        assert_eq!(record.total_files, written.len());

        manager
            .restore_backup(&record.backup_id, target.path())
            .unwrap();
        let label = source.path().file_name().unwrap();
        for name in written {
            let content = fs::read_to_string(target.path().join(label).join(name)).unwrap();
            assert_eq!(content, format!("Content of {}", name));
        }
    }

    #[test]
    fn test_empty_files_and_deep_nesting() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let deep = source.path().join("a/b/c/d/e/f/g/h");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("leaf.txt"), "deep").unwrap();
        fs::write(source.path().join("empty.txt"), "").unwrap();
        // Empty directories carry no files and are not archived
        fs::create_dir_all(source.path().join("hollow")).unwrap();

        let config = config_for(&[source.path()], backups.path());
        let manager = BackupManager::for_config(&config).unwrap();
        let record = manager.create_backup(None, &config).unwrap();
        assert_eq!(record.total_files, 2);
        assert_eq!(record.total_size_bytes, 4);

        manager
            .restore_backup(&record.backup_id, target.path())
            .unwrap();
        let label = source.path().file_name().unwrap();
        assert_eq!(
            fs::read(target.path().join(label).join("empty.txt")).unwrap(),
            Vec::<u8>::new()
        );
        assert_eq!(
            fs::read_to_string(target.path().join(label).join("a/b/c/d/e/f/g/h/leaf.txt")).unwrap(),
            "deep"
        );
        assert!(!target.path().join(label).join("hollow").exists());
    }

    #[test]
    fn test_hidden_and_excluded_files() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();

        fs::write(source.path().join("visible.txt"), "v").unwrap();
        fs::write(source.path().join(".env"), "SECRET=1").unwrap();
        fs::create_dir_all(source.path().join("node_modules/pkg")).unwrap();
        fs::write(source.path().join("node_modules/pkg/index.js"), "x").unwrap();
        fs::create_dir_all(source.path().join("__pycache__")).unwrap();
        fs::write(source.path().join("__pycache__/mod.cpython.pyc"), "x").unwrap();
        fs::write(source.path().join("script.pyc"), "x").unwrap();

        let mut config = config_for(&[source.path()], backups.path());
        let manager = BackupManager::for_config(&config).unwrap();
        let record = manager.create_backup(Some("default".into()), &config).unwrap();
        assert_eq!(record.total_files, 1);

        config.include_hidden = true;
        let record = manager.create_backup(Some("hidden".into()), &config).unwrap();
        assert_eq!(record.total_files, 2);
    }

    #[test]
    fn test_single_file_and_duplicate_basenames() {
        let workspace = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let first = workspace.path().join("one/data");
        let second = workspace.path().join("two/data");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(first.join("a.txt"), "first").unwrap();
        fs::write(second.join("a.txt"), "second").unwrap();
        let single = workspace.path().join("notes.md");
        fs::write(&single, "single file root").unwrap();

        let config = config_for(&[&first, &second, &single], backups.path());
        let manager = BackupManager::for_config(&config).unwrap();
        let record = manager.create_backup(None, &config).unwrap();
        assert_eq!(record.total_files, 3);

        manager
            .restore_backup(&record.backup_id, target.path())
            .unwrap();
        assert_eq!(fs::read_to_string(target.path().join("data/a.txt")).unwrap(), "first");
        assert_eq!(fs::read_to_string(target.path().join("data-1/a.txt")).unwrap(), "second");
        assert_eq!(
            fs::read_to_string(target.path().join("notes.md")).unwrap(),
            "single file root"
        );
    }

    #[test]
    fn test_backup_location_inside_source_is_not_archived() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("data.txt"), "payload").unwrap();
        let location = source.path().join("backups");

        let config = config_for(&[source.path()], &location);
        let manager = BackupManager::for_config(&config).unwrap();
        manager.create_backup(Some("first".into()), &config).unwrap();
        let second = manager.create_backup(Some("second".into()), &config).unwrap();

        // The first artifact and the registry are never picked up
        assert_eq!(second.total_files, 1);
    }

    #[test]
    fn test_registry_survives_reopen() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(source.path().join("f.txt"), "content").unwrap();

        let config = config_for(&[source.path()], backups.path());
        let record = {
            let manager = BackupManager::for_config(&config).unwrap();
            manager.create_backup(None, &config).unwrap()
        };

        let registry = backups.path().join(store::REGISTRY_FILE);
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&registry).unwrap()).unwrap();
        assert_eq!(json["format_version"], 1);
        assert_eq!(json["records"][0]["status"], "completed");
        assert_eq!(json["records"][0]["compression_type"], "tar.gz");

        let manager = BackupManager::open(backups.path()).unwrap();
        let reloaded = manager.get_backup_status(&record.backup_id).unwrap();
        assert_eq!(reloaded.status, BackupStatus::Completed);
        assert_eq!(reloaded.checksum, record.checksum);
        assert_eq!(reloaded.timestamp, record.timestamp);
        assert_eq!(reloaded.total_files, record.total_files);
        assert_eq!(reloaded.config_fingerprint, record.config_fingerprint);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(source.path().join("real.txt"), "real").unwrap();
        std::os::unix::fs::symlink(source.path().join("real.txt"), source.path().join("link.txt"))
            .unwrap();

        let config = config_for(&[source.path()], backups.path());
        let manager = BackupManager::for_config(&config).unwrap();
        let record = manager.create_backup(None, &config).unwrap();
        assert_eq!(record.total_files, 1);
        assert_eq!(record.skipped_files.len(), 1);
        assert_eq!(record.skipped_files[0].reason, SkipReason::NotRegularFile);
    }
}
