//! The daemon's control loop.
//!
//! Each tick polls for devices, checks free space on the backup store,
//! starts one worker per newly attached disk, prints worker progress and
//! reaps finished workers. Workers run on the blocking pool so a hung or
//! panicking backup never stalls detection or the other disks.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::context::AppContext;
use crate::core::error::{BackupError, Result};
use crate::core::fs_ops::{FreeSpace, FsOps};
use crate::core::progress::{self, EventLevel, ProgressEvent, ProgressSink};
use crate::core::watcher::{DeviceProbe, DeviceWatcher};
use crate::core::worker::{BackupSummary, run_backup};
use crate::logging::LogThrottle;

const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const SPACE_WARNING_INTERVAL: Duration = Duration::from_secs(60);

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every volume captured without a failed entry.
    Succeeded,
    /// The run finished but something was not captured, or it never started.
    Failed,
    /// The worker panicked or was cancelled.
    Terminated,
}

impl WorkerExit {
    /// Process-style status: 0 success, positive error, negative killed.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Terminated => -1,
        }
    }

    pub fn from_join(joined: std::result::Result<Result<BackupSummary>, JoinError>) -> Self {
        match joined {
            Ok(Ok(summary)) if summary.is_clean() => Self::Succeeded,
            Ok(_) => Self::Failed,
            Err(_) => Self::Terminated,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed (exit code {})", self.exit_code()),
            Self::Terminated => write!(f, "terminated (exit code {})", self.exit_code()),
        }
    }
}

/// Low-space warnings for the backup store, empty when all is well.
pub fn check_free_space(space: &FreeSpace, config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if space.free_inodes < config.min_free_inodes {
        warnings.push(format!(
            "only {} free inodes on backup store (minimum {})",
            space.free_inodes, config.min_free_inodes
        ));
    }
    if space.free_bytes < config.min_free_bytes {
        warnings.push(format!(
            "only {} MiB free on backup store (minimum {} MiB)",
            space.free_bytes / (1024 * 1024),
            config.min_free_bytes / (1024 * 1024)
        ));
    }
    warnings
}

pub fn query_free_space(fs: &dyn FsOps, store: &Path) -> Result<FreeSpace> {
    fs.stat_free_space(store).map_err(|source| BackupError::Storage {
        path: store.to_path_buf(),
        source,
    })
}

/// Rate-limits low-space warnings. Once the store recovers the next
/// shortage is reported straight away.
struct SpaceWatch {
    throttle: LogThrottle,
}

impl SpaceWatch {
    fn new(interval: Duration) -> Self {
        Self {
            throttle: LogThrottle::new(interval),
        }
    }

    /// Warnings to log for this poll.
    fn report(&self, space: Result<FreeSpace>, config: &AppConfig) -> Vec<String> {
        let warnings = match space {
            Ok(space) => check_free_space(&space, config),
            Err(e) => vec![e.to_string()],
        };

        if warnings.is_empty() {
            self.throttle.reset();
            Vec::new()
        } else if self.throttle.should_log() {
            warnings
        } else {
            Vec::new()
        }
    }
}

struct TrackedWorker {
    device: PathBuf,
    handle: JoinHandle<Result<BackupSummary>>,
}

pub struct Supervisor {
    ctx: AppContext,
    watcher: DeviceWatcher,
    workers: Vec<TrackedWorker>,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    progress_rx: mpsc::UnboundedReceiver<ProgressEvent>,
    space_watch: SpaceWatch,
}

impl Supervisor {
    pub fn new(ctx: AppContext, probe: Box<dyn DeviceProbe>) -> Self {
        let blacklist = ctx.config.blacklist.clone();
        let watcher = DeviceWatcher::new(probe, blacklist, ctx.config.debounce());
        let (progress_tx, progress_rx) = progress::channel();

        Self {
            ctx,
            watcher,
            workers: Vec::new(),
            progress_tx,
            progress_rx,
            space_watch: SpaceWatch::new(SPACE_WARNING_INTERVAL),
        }
    }

    /// Remember the devices attached at startup so they are not backed up.
    pub fn prime(&mut self) {
        if let Err(e) = self.watcher.prime() {
            warn!(error = %e, "Could not list devices at startup");
        }
    }

    /// Run until `shutdown` fires, then wait for in-flight backups.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            patterns = ?self.ctx.config.device_patterns,
            backup_directory = %self.ctx.config.backup_directory.display(),
            "Watching for devices"
        );
        self.prime();

        loop {
            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.poll_interval()) => {}
                _ = shutdown.recv() => {
                    info!("Supervisor shutting down");
                    break;
                }
            }
        }

        self.wait_for_workers().await;
    }

    /// One pass of the control loop. Returns the workers that finished.
    pub async fn tick(&mut self) -> Vec<(PathBuf, WorkerExit)> {
        let attached = match self.watcher.poll().await {
            Ok(detection) => detection.attached,
            Err(e) => {
                warn!(error = %e, "Device enumeration failed, skipping this poll");
                Vec::new()
            }
        };

        self.preflight();

        for device in attached {
            if self.is_running(&device) {
                warn!(device = %device.display(), "Backup already running for device");
                continue;
            }
            self.spawn(device);
        }

        self.drain_progress();
        self.reap().await
    }

    pub fn running(&self) -> Vec<PathBuf> {
        self.workers.iter().map(|w| w.device.clone()).collect()
    }

    fn is_running(&self, device: &Path) -> bool {
        self.workers.iter().any(|w| &w.device == device)
    }

    fn preflight(&self) {
        let store = &self.ctx.config.backup_directory;
        let space = query_free_space(self.ctx.fs.as_ref(), store);
        for warning in self.space_watch.report(space, &self.ctx.config) {
            warn!(path = %store.display(), "{}", warning);
        }
    }

    fn spawn(&mut self, device: PathBuf) {
        info!(device = %device.display(), "Device attached, starting backup");

        let ctx = self.ctx.clone();
        let sink = ProgressSink::new(device.display().to_string(), self.progress_tx.clone());
        let target = device.clone();
        let handle = tokio::task::spawn_blocking(move || run_backup(&ctx, &target, &sink));

        self.workers.push(TrackedWorker { device, handle });
    }

    fn drain_progress(&mut self) {
        let verbose = self.ctx.config.verbose;
        for event in progress::drain(&mut self.progress_rx) {
            log_event(&event, verbose);
        }
    }

    async fn reap(&mut self) -> Vec<(PathBuf, WorkerExit)> {
        let mut finished = Vec::new();
        let mut still_running = Vec::new();

        for mut worker in std::mem::take(&mut self.workers) {
            match tokio::time::timeout(JOIN_TIMEOUT, &mut worker.handle).await {
                Err(_) => still_running.push(worker),
                Ok(joined) => {
                    log_join(&worker.device, &joined);
                    let exit = WorkerExit::from_join(joined);
                    self.request_sync();
                    finished.push((worker.device, exit));
                }
            }
        }

        self.workers = still_running;
        // Events emitted between the last drain and worker exit
        self.drain_progress();
        finished
    }

    fn request_sync(&self) {
        let fs = self.ctx.fs.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = fs.sync() {
                warn!(error = %e, "Storage sync failed");
            }
        });
    }

    async fn wait_for_workers(&mut self) {
        while !self.workers.is_empty() {
            info!(running = ?self.running(), "Waiting for running backups to finish");
            self.reap().await;
        }
    }
}

fn log_join(device: &Path, joined: &std::result::Result<Result<BackupSummary>, JoinError>) {
    let device = device.display();
    match joined {
        Ok(Ok(summary)) if summary.is_clean() => {
            info!(device = %device, summary = %summary, "Backup worker succeeded");
        }
        Ok(Ok(summary)) => {
            warn!(
                device = %device,
                summary = %summary,
                failed_volumes = ?summary.failed_volumes,
                failed_files = ?summary.stats.failed_files,
                "Backup worker finished with failures"
            );
        }
        Ok(Err(e)) => error!(device = %device, error = %e, "Backup worker failed"),
        Err(e) if e.is_panic() => error!(device = %device, "Backup worker panicked"),
        Err(e) => error!(device = %device, error = %e, "Backup worker was cancelled"),
    }
}

fn log_event(event: &ProgressEvent, verbose: bool) {
    let device = event.device.as_str();
    match event.kind.level() {
        EventLevel::Debug => debug!(device, "{}", event.kind),
        EventLevel::Verbose if verbose => info!(device, "{}", event.kind),
        EventLevel::Verbose => debug!(device, "{}", event.kind),
        EventLevel::Info => info!(device, "{}", event.kind),
        EventLevel::Warn => warn!(device, "{}", event.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedFs;
    use crate::core::models::BackupRun;
    use crate::core::walker::WalkStats;

    fn summary(failed_files: Vec<PathBuf>) -> BackupSummary {
        BackupSummary {
            run: BackupRun::new(Path::new("/b"), "sdb", "2024-01-01_00-00-00".to_string()),
            volumes: 1,
            failed_volumes: Vec::new(),
            stats: WalkStats {
                failed_files,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WorkerExit::Succeeded.exit_code(), 0);
        assert!(WorkerExit::Failed.exit_code() > 0);
        assert!(WorkerExit::Terminated.exit_code() < 0);
    }

    #[test]
    fn test_free_space_thresholds() {
        let config = AppConfig {
            min_free_inodes: 100,
            min_free_bytes: 10 * 1024 * 1024,
            ..AppConfig::default()
        };

        let plenty = FreeSpace {
            free_inodes: 1_000,
            free_bytes: 100 * 1024 * 1024,
            available_bytes: 100 * 1024 * 1024,
        };
        assert!(check_free_space(&plenty, &config).is_empty());

        let starved = FreeSpace {
            free_inodes: 5,
            free_bytes: 1024,
            available_bytes: 0,
        };
        assert_eq!(check_free_space(&starved, &config).len(), 2);
    }

    fn low_space() -> FreeSpace {
        FreeSpace {
            free_inodes: 1,
            free_bytes: 1,
            available_bytes: 1,
        }
    }

    #[test]
    fn test_space_warnings_throttled_until_recovery() {
        let config = AppConfig::default();
        let healthy = FreeSpace {
            free_inodes: u64::MAX,
            free_bytes: u64::MAX,
            available_bytes: u64::MAX,
        };
        let watch = SpaceWatch::new(Duration::from_secs(3600));

        assert_eq!(watch.report(Ok(low_space()), &config).len(), 2);
        assert!(watch.report(Ok(low_space()), &config).is_empty());

        assert!(watch.report(Ok(healthy), &config).is_empty());
        assert_eq!(watch.report(Ok(low_space()), &config).len(), 2);
    }

    #[test]
    fn test_unreadable_store_is_storage_error() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("not-mounted");

        let err = query_free_space(&SimulatedFs, &missing).unwrap_err();
        assert!(matches!(err, BackupError::Storage { ref path, .. } if *path == missing));

        let watch = SpaceWatch::new(Duration::from_secs(3600));
        let warnings = watch.report(Err(err), &AppConfig::default());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("not-mounted"));
    }

    #[tokio::test]
    async fn test_classifies_joined_workers() {
        let clean =
            tokio::task::spawn_blocking(|| -> Result<BackupSummary> { Ok(summary(vec![])) }).await;
        assert_eq!(WorkerExit::from_join(clean), WorkerExit::Succeeded);

        let partial = tokio::task::spawn_blocking(|| -> Result<BackupSummary> {
            Ok(summary(vec![PathBuf::from("/x")]))
        })
        .await;
        assert_eq!(WorkerExit::from_join(partial), WorkerExit::Failed);

        let panicked = tokio::task::spawn_blocking(|| -> Result<BackupSummary> {
            panic!("worker blew up")
        })
        .await;
        assert_eq!(WorkerExit::from_join(panicked), WorkerExit::Terminated);
    }
}
