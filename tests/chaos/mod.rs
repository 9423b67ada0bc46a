//! Chaos testing for archivist
//!
//! Damages artifacts and races operations against each other to check that
//! corruption is always caught and that a restore is either complete and
//! exact or writes nothing.

use ::archivist::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use tempfile::TempDir;
use tracing::{info, warn};

/// Chaos testing fixture
pub struct ArchivistChaosTest {
    pub source_dir: TempDir,
    pub backup_dir: TempDir,
    pub manager: Arc<BackupManager>,
    pub chaos_engine: ChaosEngine,
    pub expected: BTreeMap<PathBuf, Vec<u8>>,
}

impl ArchivistChaosTest {
    pub fn new(seed: u64) -> Self {
        let source_dir = TempDir::new().unwrap();
        let backup_dir = TempDir::new().unwrap();
        let manager = Arc::new(BackupManager::open(backup_dir.path()).unwrap());
        let mut chaos_engine = ChaosEngine::new(seed);

        let mut expected = BTreeMap::new();
        for i in 0..6 {
            let relative = PathBuf::from(format!("dir{}/file{}.bin", i % 2, i));
            let content = chaos_engine.random_bytes(2_000 + i * 1_500);
            let path = source_dir.path().join(&relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, &content).unwrap();
            expected.insert(relative, content);
        }

        Self {
            source_dir,
            backup_dir,
            manager,
            chaos_engine,
            expected,
        }
    }

    pub fn config(&self, compression: CompressionType) -> BackupConfiguration {
        BackupConfiguration::builder()
            .source_path(self.source_dir.path())
            .backup_location(self.backup_dir.path())
            .compression(compression)
            .retention(Retention::Indefinite)
            .build()
            .unwrap()
    }

    pub fn artifact(&self, record: &BackupRecord) -> PathBuf {
        record.artifact_path(self.backup_dir.path())
    }

    /// Restore `backup_id` into a fresh directory and check the outcome
    ///
    /// A refused restore must leave the directory empty; an accepted one
    /// must reproduce the source exactly. Returns whether it was accepted.
    pub fn restore_all_or_nothing(&self, backup_id: &str) -> bool {
        let target = TempDir::new().unwrap();
        match self.manager.restore_backup(backup_id, target.path()) {
            Ok(result) => {
                assert_eq!(result.restored_files.len(), self.expected.len());
                let root = target.path().join(self.source_dir.path().file_name().unwrap());
                for (relative, content) in &self.expected {
                    assert_eq!(&fs::read(root.join(relative)).unwrap(), content);
                }
                true
            }
            Err(e) => {
                assert!(e.is_integrity_failure(), "unexpected error: {}", e);
                assert_eq!(
                    fs::read_dir(target.path()).unwrap().count(),
                    0,
                    "refused restore wrote into the target"
                );
                false
            }
        }
    }
}

/// Seeded source of damage
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn random_bytes(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.rng.random()).collect()
    }

    /// Flip bits in one byte of `path` within `range`
    pub fn flip_byte(&mut self, path: &Path, range: std::ops::Range<usize>) -> usize {
        let mut bytes = fs::read(path).unwrap();
        let end = range.end.min(bytes.len());
        let at = self.rng.random_range(range.start..end);
        let mask: u8 = self.rng.random_range(1..=255);
        bytes[at] ^= mask;
        fs::write(path, &bytes).unwrap();
        at
    }

    /// Cut `path` short at a random length
    pub fn truncate(&mut self, path: &Path) -> u64 {
        let len = fs::metadata(path).unwrap().len();
        let keep = self.rng.random_range(0..len);
        OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_len(keep)
            .unwrap();
        keep
    }
}

#[test]
fn test_content_corruption_is_always_caught() {
    let mut chaos = ArchivistChaosTest::new(7);
    let config = chaos.config(CompressionType::Tar);

    for round in 0..8 {
        let record = chaos.manager.create_backup(Some(format!("tar_{}", round)), &config).unwrap();
        let artifact = chaos.artifact(&record);

        // The first entry's content starts right after its 512-byte header
        let first_size = chaos.expected.values().next().unwrap().len();
        let at = chaos.chaos_engine.flip_byte(&artifact, 512..512 + first_size);
        info!("Round {}: flipped byte {} of {:?}", round, at, artifact);

        assert!(!chaos.restore_all_or_nothing(&record.backup_id));
        assert_eq!(
            chaos.manager.get_backup_status(&record.backup_id).unwrap().status,
            BackupStatus::Corrupted
        );
    }
}

#[test]
fn test_compressed_stream_corruption() {
    let mut chaos = ArchivistChaosTest::new(11);
    let mut caught = 0;
    let mut trials = 0;

    for compression in [CompressionType::TarGz, CompressionType::TarBz2] {
        let config = chaos.config(compression);
        for round in 0..10 {
            let id = format!("{}_{}", compression.extension().replace('.', "_"), round);
            let record = chaos.manager.create_backup(Some(id), &config).unwrap();
            let artifact = chaos.artifact(&record);
            let len = fs::metadata(&artifact).unwrap().len() as usize;
            chaos.chaos_engine.flip_byte(&artifact, 0..len);

            trials += 1;
            if !chaos.restore_all_or_nothing(&record.backup_id) {
                caught += 1;
            } else {
                // Flips the decoder cannot see (header fields) leave content intact
                warn!("Flip in {} left the artifact readable", record.backup_id);
            }
        }
    }

    info!("Caught {}/{} corrupted artifacts", caught, trials);
    assert!(caught > trials / 2);
}

#[test]
fn test_truncated_artifacts() {
    let mut chaos = ArchivistChaosTest::new(23);

    for compression in CompressionType::ALL {
        let config = chaos.config(compression);
        for round in 0..4 {
            let id = format!("trunc_{}_{}", compression.as_str().replace('.', "_"), round);
            let record = chaos.manager.create_backup(Some(id), &config).unwrap();
            let artifact = chaos.artifact(&record);
            let kept = chaos.chaos_engine.truncate(&artifact);
            info!("Truncated {} to {} bytes", record.backup_id, kept);

            // Truncating only the end-of-archive padding may leave a valid tar
            chaos.restore_all_or_nothing(&record.backup_id);
        }
    }
}

#[test]
fn test_artifact_replaced_by_another_backup() {
    let chaos = ArchivistChaosTest::new(31);
    let config = chaos.config(CompressionType::Zip);
    let first = chaos.manager.create_backup(Some("first".into()), &config).unwrap();

    fs::write(chaos.source_dir.path().join("dir0/file0.bin"), b"changed").unwrap();
    let second = chaos.manager.create_backup(Some("second".into()), &config).unwrap();
    assert_ne!(first.checksum, second.checksum);

    // Swap artifacts: each is a valid zip, neither matches its record
    fs::copy(chaos.artifact(&second), chaos.artifact(&first)).unwrap();
    let err = chaos
        .manager
        .restore_backup("first", TempDir::new().unwrap().path())
        .unwrap_err();
    assert!(err.is_integrity_failure());
    assert_eq!(
        chaos.manager.get_backup_status("first").unwrap().status,
        BackupStatus::Corrupted
    );
    assert_eq!(
        chaos.manager.get_backup_status("second").unwrap().status,
        BackupStatus::Completed
    );
}

#[test]
fn test_concurrent_backups_of_one_configuration() {
    let chaos = ArchivistChaosTest::new(41);
    let config = Arc::new(chaos.config(CompressionType::TarGz));
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    // Thread index of every progress report, in the order they happened
    let trace = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..threads)
        .map(|index| {
            let manager = Arc::clone(&chaos.manager);
            let config = Arc::clone(&config);
            let barrier = Arc::clone(&barrier);
            let trace = Arc::clone(&trace);
            thread::spawn(move || {
                let options = BackupOptions {
                    progress_callback: Some(Arc::new(move |_info: ProgressInfo| {
                        trace.lock().unwrap().push(index);
                    })),
                    ..Default::default()
                };
                barrier.wait();
                manager.create_backup_with_options(&config, options)
            })
        })
        .collect();

    let records: Vec<BackupRecord> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    // Runs never interleave: each thread's reports form one contiguous block
    let trace = trace.lock().unwrap();
    let mut blocks: Vec<usize> = trace.clone();
    blocks.dedup();
    let distinct: HashSet<usize> = trace.iter().copied().collect();
    assert_eq!(distinct.len(), threads);
    assert_eq!(blocks.len(), threads, "interleaved runs: {:?}", blocks);

    let ids: HashSet<&str> = records.iter().map(|r| r.backup_id.as_str()).collect();
    assert_eq!(ids.len(), threads);
    for record in &records {
        assert_eq!(record.status, BackupStatus::Completed);
        assert!(chaos.artifact(record).exists());
    }

    // The registry on disk agrees with what the threads saw
    let reopened = BackupManager::open(chaos.backup_dir.path()).unwrap();
    assert_eq!(reopened.list_backups().unwrap().len(), threads);
}

#[test]
fn test_instances_racing_on_one_location() {
    let chaos = ArchivistChaosTest::new(47);
    let config = chaos.config(CompressionType::TarGz);
    let instances = 3;
    let barrier = Arc::new(Barrier::new(instances));

    // Each thread stands in for a separate process with its own manager
    let handles: Vec<_> = (0..instances)
        .map(|_| {
            let location = chaos.backup_dir.path().to_path_buf();
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let manager = BackupManager::open(&location).unwrap();
                barrier.wait();
                let first = manager.create_backup(None, &config).unwrap();
                let second = manager.create_backup(None, &config).unwrap();
                vec![first, second]
            })
        })
        .collect();

    let records: Vec<BackupRecord> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let ids: HashSet<&str> = records.iter().map(|r| r.backup_id.as_str()).collect();
    assert_eq!(ids.len(), instances * 2);

    let listed = chaos.manager.list_backups().unwrap();
    assert_eq!(listed.len(), instances * 2);
    for record in &listed {
        assert!(ids.contains(record.backup_id.as_str()));
        assert_eq!(record.status, BackupStatus::Completed);
        assert!(chaos.artifact(record).exists());
    }
    assert!(chaos.restore_all_or_nothing(&listed[0].backup_id));
}

#[test]
fn test_try_create_while_running() {
    let chaos = ArchivistChaosTest::new(43);
    let config = chaos.config(CompressionType::Tar);
    let guard = chaos.manager.run_locks().try_acquire(&config.fingerprint()).unwrap();
    assert!(chaos.manager.run_locks().is_running(&config.fingerprint()));

    let err = chaos.manager.try_create_backup(None, &config).unwrap_err();
    assert!(matches!(err, ArchivistError::Busy(_)));
    assert!(err.is_recoverable());

    drop(guard);
    chaos.manager.try_create_backup(None, &config).unwrap();
}

#[test]
fn test_restores_racing_delete() {
    let chaos = Arc::new(ArchivistChaosTest::new(53));
    let config = chaos.config(CompressionType::Zip);
    let record = chaos.manager.create_backup(Some("contended".into()), &config).unwrap();
    let artifact = chaos.artifact(&record);

    let restorers: Vec<_> = (0..3)
        .map(|_| {
            let chaos = Arc::clone(&chaos);
            thread::spawn(move || {
                let mut completed = 0;
                for _ in 0..10 {
                    let target = TempDir::new().unwrap();
                    match chaos.manager.restore_backup("contended", target.path()) {
                        Ok(result) => {
                            assert_eq!(result.restored_files.len(), chaos.expected.len());
                            completed += 1;
                        }
                        Err(ArchivistError::NotFound(_)) | Err(ArchivistError::InUse(_)) => {
                            assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
                        }
                        Err(e) => panic!("unexpected restore error: {}", e),
                    }
                }
                completed
            })
        })
        .collect();

    let deleter = {
        let chaos = Arc::clone(&chaos);
        thread::spawn(move || loop {
            match chaos.manager.delete_backup("contended") {
                Ok(_) => return,
                Err(ArchivistError::InUse(_)) => thread::yield_now(),
                Err(e) => panic!("unexpected delete error: {}", e),
            }
        })
    };

    let completed: usize = restorers.into_iter().map(|h| h.join().unwrap()).sum();
    deleter.join().unwrap();
    info!("{} restores completed before the delete", completed);

    assert!(chaos.manager.get_backup_status("contended").is_err());
    assert!(!artifact.exists());
}

#[test]
fn test_missing_and_foreign_files_in_location() {
    let chaos = ArchivistChaosTest::new(61);
    let config = chaos.config(CompressionType::TarGz);
    let kept = chaos.manager.create_backup(Some("kept".into()), &config).unwrap();
    let lost = chaos.manager.create_backup(Some("lost".into()), &config).unwrap();

    fs::remove_file(chaos.artifact(&lost)).unwrap();
    let stray = chaos.backup_dir.path().join("backup_20200101_000000.tar.gz");
    fs::write(&stray, b"not a registered artifact").unwrap();
    let notes = chaos.backup_dir.path().join("notes.txt");
    fs::write(&notes, b"operator notes").unwrap();

    assert!(!chaos.restore_all_or_nothing("lost"));
    assert!(chaos.restore_all_or_nothing("kept"));

    let orphans = RetentionManager::new(Arc::clone(chaos.manager.store()))
        .find_orphaned_artifacts()
        .unwrap();
    assert_eq!(orphans, vec![stray]);

    let report = chaos.manager.sweep_retention(&config).unwrap();
    assert_eq!(report.orphans_removed.len(), 1);
    assert!(notes.exists());
    assert!(chaos.artifact(&kept).exists());
}
