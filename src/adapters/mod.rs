//! Filesystem-operations adapters.
//!
//! `LinuxFs` talks to the kernel (mount(2), statvfs, sync); `SimulatedFs`
//! stands in plain directories for devices so the whole pipeline can run
//! unprivileged. Both share the file-level primitives below.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::core::fs_ops::{FreeSpace, FsOps};

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::LinuxFs;
pub use simulated::SimulatedFs;

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

pub fn get_fs_ops(simulation: bool) -> Arc<dyn FsOps> {
    if simulation {
        return Arc::new(SimulatedFs);
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxFs)
    }

    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("No native adapter for this platform, using simulation");
        Arc::new(SimulatedFs)
    }
}

/// Copy a single file, fsync it, and optionally carry over permissions and
/// timestamps.
fn copy_file(source: &Path, dest: &Path, preserve_attrs: bool) -> io::Result<u64> {
    let source_metadata = fs::metadata(source)?;

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(source)?);
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, File::create(dest)?);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..bytes_read])?;
        bytes_written += bytes_read as u64;
    }

    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    if preserve_attrs {
        // Permission and timestamp errors happen on some filesystems; the
        // content is what matters
        if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
            debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
        }

        let atime = filetime::FileTime::from_last_access_time(&source_metadata);
        let mtime = filetime::FileTime::from_last_modification_time(&source_metadata);
        if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
            debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
        }
    }

    Ok(bytes_written)
}

fn create_symlink(target: &Path, dest: &Path) -> io::Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(m) if m.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", dest.display()),
            ));
        }
        Ok(_) => fs::remove_file(dest)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, dest)
}

fn read_symlink(source: &Path) -> io::Result<PathBuf> {
    fs::read_link(source)
}

fn statvfs(path: &Path) -> io::Result<FreeSpace> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    let fragment = stat.fragment_size() as u64;

    Ok(FreeSpace {
        free_inodes: stat.files_free() as u64,
        free_bytes: stat.blocks_free() as u64 * fragment,
        available_bytes: stat.blocks_available() as u64 * fragment,
    })
}
