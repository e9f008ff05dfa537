use devsnap::adapters::SimulatedFs;
use devsnap::config::AppConfig;
use devsnap::context::AppContext;
use devsnap::core::progress::{self, ProgressKind, ProgressSink};
use devsnap::core::hasher;
use devsnap::core::supervisor::check_free_space;
use devsnap::core::{BackupSummary, FsOps, SqliteDedupIndex, run_backup};
use devsnap::db;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    devices: PathBuf,
    backups: PathBuf,
    config: AppConfig,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let devices = temp.path().join("dev");
        let backups = temp.path().join("backups");
        std::fs::create_dir_all(&devices).unwrap();
        std::fs::create_dir_all(&backups).unwrap();

        let config = AppConfig {
            backup_directory: backups.clone(),
            mount_directory: temp.path().join("mnt"),
            database_path: Some(temp.path().join("records.db")),
            simulation: true,
            settle_secs: 0,
            min_free_inodes: 0,
            min_free_bytes: 0,
            ..AppConfig::default()
        };

        Self {
            _temp: temp,
            devices,
            backups,
            config,
        }
    }

    fn create_file(&self, relative: &str, content: &[u8]) {
        let path = self.devices.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// Run one worker to completion the way the supervisor does.
    async fn backup(&self, config: &AppConfig, disk: &str) -> (BackupSummary, Vec<ProgressKind>) {
        let conn = db::init(&config.database_path()).await.unwrap();
        let index = Arc::new(SqliteDedupIndex::new(conn));
        let ctx = AppContext::new(config.clone(), Arc::new(SimulatedFs), index);

        let (tx, mut rx) = progress::channel();
        let device = self.devices.join(disk);
        let sink = ProgressSink::new(device.display().to_string(), tx);

        let summary = tokio::task::spawn_blocking(move || run_backup(&ctx, &device, &sink))
            .await
            .unwrap()
            .unwrap();

        let events = progress::drain(&mut rx).into_iter().map(|e| e.kind).collect();
        (summary, events)
    }
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_whole_device_backup_skips_hidden_entries() {
    let fx = Fixture::new();
    fx.create_file("sdb/a.txt", b"hello");
    fx.create_file("sdb/.trash/b.txt", b"deleted");
    fx.create_file("sdb/photos/2024/img.jpg", b"jpeg bytes");

    let (summary, events) = fx.backup(&fx.config, "sdb").await;

    assert!(summary.is_clean(), "{}", summary);
    assert_eq!(summary.volumes, 1);
    assert_eq!(summary.stats.copied, 2);
    assert_eq!(summary.stats.skipped_hidden, 1);

    let dest = &summary.run.destination;
    assert!(dest.starts_with(&fx.backups));
    assert_eq!(read(&dest.join("a.txt")), b"hello");
    assert_eq!(read(&dest.join("photos/2024/img.jpg")), b"jpeg bytes");
    assert!(!dest.join(".trash").exists());

    assert!(matches!(events.first(), Some(ProgressKind::RunStarted { .. })));
    assert!(matches!(events.last(), Some(ProgressKind::RunFinished { .. })));

    // Staging area is cleaned up and the device left alone
    assert!(!fx.config.mount_directory.join("sdb").exists());
    assert_eq!(read(&fx.devices.join("sdb/a.txt")), b"hello");

    let conn = db::init(&fx.config.database_path()).await.unwrap();
    let records = db::records::for_timestamp(&conn, summary.run.timestamp.clone())
        .await
        .unwrap();
    let a_records: Vec<_> = records
        .iter()
        .filter(|r| r.destination_path == dest.join("a.txt"))
        .collect();
    assert_eq!(a_records.len(), 1);
    let record = a_records[0];
    assert_eq!(
        record.digest,
        hasher::digest(&fx.devices.join("sdb/a.txt"), false).unwrap()
    );
    assert_eq!(record.source_path, fx.config.mount_directory.join("sdb/a.txt"));
    assert!(records.iter().all(|r| !r.destination_path.starts_with(dest.join(".trash"))));

    // Thresholds the store satisfies produce no warnings
    let space = SimulatedFs.stat_free_space(&fx.backups).unwrap();
    assert!(check_free_space(&space, &fx.config).is_empty());
    let strict = AppConfig {
        min_free_inodes: u64::MAX,
        min_free_bytes: u64::MAX,
        ..fx.config.clone()
    };
    assert_eq!(check_free_space(&space, &strict).len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dotfiles_are_copied_when_enabled() {
    let fx = Fixture::new();
    fx.create_file("sdb/a.txt", b"hello");
    fx.create_file("sdb/.trash/b.txt", b"deleted");

    let config = AppConfig {
        copy_dotfiles: true,
        ..fx.config.clone()
    };
    let (summary, _) = fx.backup(&config, "sdb").await;

    assert_eq!(summary.stats.copied, 2);
    assert_eq!(read(&summary.run.destination.join(".trash/b.txt")), b"deleted");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partitions_get_their_own_subdirectories() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.devices.join("sdc")).unwrap();
    fx.create_file("sdc1/DCIM/one.jpg", b"first partition");
    fx.create_file("sdc2/notes.txt", b"second partition");

    let (summary, events) = fx.backup(&fx.config, "sdc").await;

    assert!(summary.is_clean(), "{}", summary);
    assert_eq!(summary.volumes, 2);
    let dest = &summary.run.destination;
    assert_eq!(read(&dest.join("sdc1/DCIM/one.jpg")), b"first partition");
    assert_eq!(read(&dest.join("sdc2/notes.txt")), b"second partition");

    let mounted: Vec<&PathBuf> = events
        .iter()
        .filter_map(|e| match e {
            ProgressKind::MountingVolume { address } => Some(address),
            _ => None,
        })
        .collect();
    assert_eq!(mounted, vec![&fx.devices.join("sdc1"), &fx.devices.join("sdc2")]);
    assert!(!fx.config.mount_directory.join("sdc").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_partition_does_not_stop_siblings() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.devices.join("sdd")).unwrap();
    // A plain file cannot be "mounted" by the simulated adapter
    fx.create_file("sdd1", b"not a filesystem");
    fx.create_file("sdd2/keep.txt", b"still captured");

    let (summary, _) = fx.backup(&fx.config, "sdd").await;

    assert!(!summary.is_clean());
    assert_eq!(summary.failed_volumes, vec![fx.devices.join("sdd1")]);
    assert_eq!(
        read(&summary.run.destination.join("sdd2/keep.txt")),
        b"still captured"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_run_hardlinks_against_first() {
    let fx = Fixture::new();
    fx.create_file("sde/a.txt", b"same bytes");
    fx.create_file("sde/b.txt", b"same bytes");

    let (first, _) = fx.backup(&fx.config, "sde").await;
    assert_eq!(first.stats.copied, 1);
    assert_eq!(first.stats.linked, 1);

    let (second, _) = fx.backup(&fx.config, "sde").await;
    assert_ne!(first.run.destination, second.run.destination);
    assert_eq!(second.stats.copied, 0);
    assert_eq!(second.stats.linked, 2);

    let original = std::fs::metadata(first.run.destination.join("a.txt")).unwrap();
    let linked = std::fs::metadata(second.run.destination.join("b.txt")).unwrap();
    assert_eq!(original.ino(), linked.ino());
    assert_eq!(original.nlink(), 4);

    let conn = db::init(&fx.config.database_path()).await.unwrap();
    let rows = db::records::for_timestamp(&conn, first.run.timestamp.clone())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_symlinks_are_recreated_not_followed() {
    let fx = Fixture::new();
    fx.create_file("sdf/real.txt", b"target");
    std::os::unix::fs::symlink("real.txt", fx.devices.join("sdf/alias")).unwrap();
    std::os::unix::fs::symlink("..", fx.devices.join("sdf/loop")).unwrap();

    let (summary, _) = fx.backup(&fx.config, "sdf").await;

    assert!(summary.is_clean(), "{}", summary);
    assert_eq!(summary.stats.symlinks, 2);
    assert_eq!(summary.stats.copied, 1);
    let dest = &summary.run.destination;
    assert_eq!(std::fs::read_link(dest.join("alias")).unwrap(), PathBuf::from("real.txt"));
    assert_eq!(std::fs::read_link(dest.join("loop")).unwrap(), PathBuf::from(".."));
}
