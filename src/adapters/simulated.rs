use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::fs_ops::{FreeSpace, FsOps, MountOptions};

/// Filesystem operations for simulation runs.
///
/// "Devices" are plain directories. Mounting swaps the (empty) staging
/// directory for a symlink to the device directory; unmounting swaps it back,
/// so the mount lifecycle behaves like the real one without privileges.
pub struct SimulatedFs;

impl FsOps for SimulatedFs {
    fn mount(&self, device: &Path, target: &Path, _options: &MountOptions) -> io::Result<()> {
        if !fs::metadata(device)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a simulated device directory", device.display()),
            ));
        }

        fs::remove_dir(target)?;
        let device = fs::canonicalize(device)?;
        std::os::unix::fs::symlink(&device, target)?;

        debug!(device = %device.display(), target = %target.display(), "(SimulatedFs) Mounted");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let metadata = fs::symlink_metadata(target)?;
        if !metadata.file_type().is_symlink() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not mounted", target.display()),
            ));
        }

        fs::remove_file(target)?;
        fs::create_dir(target)?;

        debug!(target = %target.display(), "(SimulatedFs) Unmounted");
        Ok(())
    }

    fn copy(&self, source: &Path, destination: &Path, preserve_attrs: bool) -> io::Result<u64> {
        super::copy_file(source, destination, preserve_attrs)
    }

    fn hardlink(&self, existing: &Path, destination: &Path) -> io::Result<()> {
        fs::hard_link(existing, destination)
    }

    fn read_symlink(&self, source: &Path) -> io::Result<PathBuf> {
        super::read_symlink(source)
    }

    fn create_symlink(&self, target: &Path, destination: &Path) -> io::Result<()> {
        super::create_symlink(target, destination)
    }

    fn make_directories(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_directory(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn stat_free_space(&self, path: &Path) -> io::Result<FreeSpace> {
        super::statvfs(path)
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}
