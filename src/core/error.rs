use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures raised while capturing a device.
///
/// Apart from start-up problems none of these are fatal to the daemon: a
/// volume-level error aborts that volume's walk, a file-level error is
/// reported and the walk carries on with the next entry.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to enumerate devices for pattern {pattern}: {message}")]
    DeviceEnumeration { pattern: String, message: String },

    #[error("Failed to mount {} at {}: {message}", .device.display(), .target.display())]
    Mount {
        device: PathBuf,
        target: PathBuf,
        message: String,
    },

    #[error("Failed to unmount {}: {message}", .target.display())]
    Unmount { target: PathBuf, message: String },

    #[error("Failed to hash {}: {source}", .path.display())]
    Hash {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Digest mismatch copying {} (attempt {attempt})", .source_path.display())]
    VerificationMismatch { source_path: PathBuf, attempt: u32 },

    #[error("Could not copy {} after {attempts} attempts{}", .source_path.display(), removal_note(.device_removed))]
    ExhaustedRetries {
        source_path: PathBuf,
        attempts: u32,
        device_removed: bool,
    },

    #[error("Failed to link {} -> {}: {source}", .source_path.display(), .destination.display())]
    Link {
        source_path: PathBuf,
        destination: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to record {} in the dedup index: {message}", .destination.display())]
    RecordStore { destination: PathBuf, message: String },

    #[error("Failed to query backup store free space at {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn removal_note(device_removed: &bool) -> &'static str {
    if *device_removed {
        " (device appears to have been removed)"
    } else {
        ""
    }
}

impl BackupError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Check if an I/O error indicates the device has been removed
pub fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        io::ErrorKind::NotFound => true,
        io::ErrorKind::PermissionDenied => false,
        io::ErrorKind::BrokenPipe => true,
        io::ErrorKind::NotConnected => true,
        _ => {
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EIO | libc::ENODEV | libc::ENXIO | libc::ENOMEDIUM | libc::EMEDIUMTYPE
                )
            } else {
                false
            }
        }
    }
}
