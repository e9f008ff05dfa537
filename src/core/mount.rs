//! Scoped read-only mounts.
//!
//! A [`MountGuard`] owns its staging directory: the volume is unmounted and
//! the directory removed when the guard is released or dropped, whether the
//! walk finished, failed, or panicked.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::error::{BackupError, Result};
use crate::core::fs_ops::{FsOps, MountOptions};

pub struct MountGuard<'a> {
    fs: &'a dyn FsOps,
    device: PathBuf,
    mount_point: PathBuf,
    released: bool,
}

impl<'a> MountGuard<'a> {
    /// Create `staging` (replacing a stale one) and mount `device` on it.
    pub fn mount(
        fs: &'a dyn FsOps,
        device: &Path,
        staging: &Path,
        options: &MountOptions,
    ) -> Result<Self> {
        prepare_staging(fs, device, staging)?;

        if let Err(e) = fs.mount(device, staging, options) {
            if let Err(cleanup) = fs.remove_directory(staging) {
                debug!(path = %staging.display(), error = %cleanup, "Failed to remove staging dir");
            }
            return Err(BackupError::Mount {
                device: device.to_path_buf(),
                target: staging.to_path_buf(),
                message: e.to_string(),
            });
        }

        debug!(device = %device.display(), mount_point = %staging.display(), "Volume mounted");
        Ok(Self {
            fs,
            device: device.to_path_buf(),
            mount_point: staging.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.mount_point
    }

    /// Unmount and remove the staging directory, reporting failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.teardown()
    }

    fn teardown(&self) -> Result<()> {
        self.fs
            .unmount(&self.mount_point)
            .map_err(|e| BackupError::Unmount {
                target: self.mount_point.clone(),
                message: e.to_string(),
            })?;

        self.fs
            .remove_directory(&self.mount_point)
            .map_err(|e| BackupError::io(&self.mount_point, e))?;

        debug!(device = %self.device.display(), "Volume unmounted");
        Ok(())
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.teardown() {
            warn!(device = %self.device.display(), error = %e, "Cleanup after failed walk incomplete");
        }
    }
}

fn prepare_staging(fs: &dyn FsOps, device: &Path, staging: &Path) -> Result<()> {
    if staging.symlink_metadata().is_ok() {
        // Left over from a crashed run; it may still be mounted
        if fs.unmount(staging).is_ok() {
            warn!(path = %staging.display(), "Unmounted stale staging mount");
        }
        fs.remove_directory(staging).map_err(|e| BackupError::Mount {
            device: device.to_path_buf(),
            target: staging.to_path_buf(),
            message: format!("stale staging directory could not be removed: {}", e),
        })?;
    }

    fs.make_directories(staging)
        .map_err(|e| BackupError::Mount {
            device: device.to_path_buf(),
            target: staging.to_path_buf(),
            message: format!("could not create staging directory: {}", e),
        })
}
