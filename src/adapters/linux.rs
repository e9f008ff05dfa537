use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::core::fs_ops::{FreeSpace, FsOps, MountOptions};

/// Kernel-backed filesystem operations. Mounting requires root.
pub struct LinuxFs;

impl LinuxFs {
    fn mount_flags(options: &MountOptions) -> MsFlags {
        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
        if options.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        flags
    }

    /// mount(2) does not probe, so walk the hint list until one type sticks.
    fn mount_with_hints(device: &Path, target: &Path, options: &MountOptions) -> io::Result<()> {
        let flags = Self::mount_flags(options);
        let mut last_error = Errno::ENODEV;

        for fstype in &options.fstype_hints {
            match mount(Some(device), target, Some(fstype.as_str()), flags, None::<&str>) {
                Ok(()) => {
                    debug!(
                        device = %device.display(),
                        target = %target.display(),
                        fstype = fstype.as_str(),
                        "Mounted"
                    );
                    return Ok(());
                }
                // Wrong type or driver missing: try the next one
                Err(e @ (Errno::EINVAL | Errno::ENODEV | Errno::EIO)) => last_error = e,
                Err(e) => return Err(io::Error::from(e)),
            }
        }

        Err(io::Error::from(last_error))
    }

    /// Let mount(8) auto-detect the filesystem type.
    fn mount_auto(device: &Path, target: &Path, options: &MountOptions) -> io::Result<()> {
        let opts = if options.read_only {
            "ro,nosuid,nodev,noexec"
        } else {
            "nosuid,nodev,noexec"
        };
        let output = Command::new("mount")
            .arg("-o")
            .arg(opts)
            .arg(device)
            .arg(target)
            .output()?;

        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "mount exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl FsOps for LinuxFs {
    fn mount(&self, device: &Path, target: &Path, options: &MountOptions) -> io::Result<()> {
        if options.fstype_hints.is_empty() {
            Self::mount_auto(device, target, options)
        } else {
            Self::mount_with_hints(device, target, options)
        }
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => Ok(()),
            Err(Errno::EBUSY) => {
                warn!(target = %target.display(), "Mount busy, detaching lazily");
                umount2(target, MntFlags::MNT_DETACH).map_err(io::Error::from)
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn copy(&self, source: &Path, destination: &Path, preserve_attrs: bool) -> io::Result<u64> {
        super::copy_file(source, destination, preserve_attrs)
    }

    fn hardlink(&self, existing: &Path, destination: &Path) -> io::Result<()> {
        std::fs::hard_link(existing, destination)
    }

    fn read_symlink(&self, source: &Path) -> io::Result<PathBuf> {
        super::read_symlink(source)
    }

    fn create_symlink(&self, target: &Path, destination: &Path) -> io::Result<()> {
        super::create_symlink(target, destination)
    }

    fn make_directories(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_directory(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn stat_free_space(&self, path: &Path) -> io::Result<FreeSpace> {
        super::statvfs(path)
    }

    fn sync(&self) -> io::Result<()> {
        nix::unistd::sync();
        Ok(())
    }
}
