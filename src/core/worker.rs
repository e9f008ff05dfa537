//! Captures one attached disk: every partition in turn, or the bare device
//! when it has no partition table, all under a single backup run.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use tracing::{info, info_span, warn};

use crate::context::AppContext;
use crate::core::copy_engine::CopyEngine;
use crate::core::error::{BackupError, Result};
use crate::core::fs_ops::MountOptions;
use crate::core::models::{BackupRun, Volume, base_name};
use crate::core::mount::MountGuard;
use crate::core::progress::{ProgressKind, ProgressSink};
use crate::core::walker::{TreeWalker, WalkStats};
use crate::core::watcher::get_partitions;

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub run: BackupRun,
    pub volumes: usize,
    pub failed_volumes: Vec<PathBuf>,
    pub stats: WalkStats,
}

impl BackupSummary {
    /// Every volume mounted, walked and released, every entry captured.
    pub fn is_clean(&self) -> bool {
        self.failed_volumes.is_empty() && self.stats.failures() == 0
    }
}

impl fmt::Display for BackupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} volume(s), {} copied, {} linked, {} symlinks, {} hidden skipped, {} failed entries, {} failed volumes",
            self.volumes,
            self.stats.copied,
            self.stats.linked,
            self.stats.symlinks,
            self.stats.skipped_hidden,
            self.stats.failures(),
            self.failed_volumes.len()
        )
    }
}

/// Back up `device` completely. Volume-level failures are reported and
/// counted; only failing to set up the run itself is an error.
pub fn run_backup(ctx: &AppContext, device: &Path, progress: &ProgressSink) -> Result<BackupSummary> {
    let config = &ctx.config;
    let disk_label = base_name(device);
    let run = BackupRun::mint(&config.backup_directory, &disk_label);

    let span = info_span!("backup", device = %device.display(), timestamp = %run.timestamp);
    let _enter = span.enter();

    ctx.fs
        .make_directories(&run.destination)
        .map_err(|e| BackupError::io(&run.destination, e))?;

    info!(destination = %run.destination.display(), "Starting backup run");
    progress.emit(ProgressKind::RunStarted {
        timestamp: run.timestamp.clone(),
        destination: run.destination.clone(),
    });

    let partitions = match get_partitions(device) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "Partition enumeration failed, treating device as one volume");
            Vec::new()
        }
    };

    let disk_staging = config.mount_directory.join(&disk_label);
    let volumes: Vec<Volume> = if partitions.is_empty() {
        vec![Volume::whole_device(device)]
    } else {
        partitions.iter().map(|p| Volume::partition(p)).collect()
    };

    let engine = CopyEngine::new(ctx, &run, progress);
    let walker = TreeWalker::new(&engine, progress, config.copy_dotfiles);

    let mut summary = BackupSummary {
        run: run.clone(),
        volumes: volumes.len(),
        failed_volumes: Vec::new(),
        stats: WalkStats::default(),
    };

    for volume in &volumes {
        let staging = match &volume.partition {
            Some(name) => disk_staging.join(name),
            None => disk_staging.clone(),
        };

        progress.emit(ProgressKind::MountingVolume {
            address: volume.address.clone(),
        });

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            backup_volume(ctx, &run, volume, &staging, &walker)
        }));

        let (stats, error) = match outcome {
            Ok(result) => result,
            Err(panic) => (None, Some(panic_message(&panic))),
        };

        if let Some(stats) = stats {
            summary.stats.merge(stats);
        }
        if let Some(error) = error {
            warn!(volume = %volume.address.display(), error = %error, "Volume backup failed");
            progress.emit(ProgressKind::VolumeFailed {
                address: volume.address.clone(),
                error,
            });
            summary.failed_volumes.push(volume.address.clone());
        }
    }

    if !partitions.is_empty() {
        if let Err(e) = ctx.fs.remove_directory(&disk_staging) {
            warn!(path = %disk_staging.display(), error = %e, "Failed to remove disk staging dir");
        }
    }

    info!(summary = %summary, "Backup run finished");
    progress.emit(ProgressKind::RunFinished {
        summary: summary.to_string(),
    });

    Ok(summary)
}

/// Mount, settle, walk, release. Returns whatever got walked plus the first
/// error hit along the way.
fn backup_volume(
    ctx: &AppContext,
    run: &BackupRun,
    volume: &Volume,
    staging: &Path,
    walker: &TreeWalker<'_>,
) -> (Option<WalkStats>, Option<String>) {
    let options = if ctx.config.simulation {
        MountOptions::read_only(Vec::new())
    } else {
        ctx.config.mount_options()
    };

    let guard = match MountGuard::mount(ctx.fs.as_ref(), &volume.address, staging, &options) {
        Ok(g) => g,
        Err(e) => return (None, Some(e.to_string())),
    };

    if volume.partition.is_some() {
        // Some card readers expose partitions before the driver is ready
        std::thread::sleep(ctx.config.settle());
    }

    let dest = volume.destination(run);
    if let Err(e) = ctx.fs.make_directories(&dest) {
        return (None, Some(BackupError::io(&dest, e).to_string()));
    }

    let stats = walker.walk(guard.path(), &dest);

    match guard.release() {
        Ok(()) => (Some(stats), None),
        Err(e) => (Some(stats), Some(e.to_string())),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("walk panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("walk panicked: {}", s)
    } else {
        "walk panicked".to_string()
    }
}
