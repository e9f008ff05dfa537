use chrono::Local;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::core::hasher::Digest;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// One timestamped capture of a single disk. Shared by every file copied
/// during a worker's execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRun {
    pub disk_label: String,
    pub timestamp: String,
    /// `backup_root/timestamp/disk_label`
    pub destination: PathBuf,
}

impl BackupRun {
    /// Mint a run for `disk_label` using the current local time.
    ///
    /// A zero-padded `.NN` suffix is appended to the timestamp if a run
    /// with the same destination already exists, so runs still sort in
    /// order.
    pub fn mint(backup_root: &Path, disk_label: &str) -> Self {
        let base = Local::now().format(TIMESTAMP_FORMAT).to_string();
        Self::mint_at(backup_root, disk_label, &base)
    }

    fn mint_at(backup_root: &Path, disk_label: &str, base: &str) -> Self {
        let mut timestamp = base.to_string();
        let mut n = 1;
        while backup_root.join(&timestamp).join(disk_label).exists() {
            timestamp = format!("{}.{:02}", base, n);
            n += 1;
        }
        Self::new(backup_root, disk_label, timestamp)
    }

    pub fn new(backup_root: &Path, disk_label: &str, timestamp: String) -> Self {
        Self {
            disk_label: disk_label.to_string(),
            destination: backup_root.join(&timestamp).join(disk_label),
            timestamp,
        }
    }
}

/// A mountable unit: the whole device or one of its partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub address: PathBuf,
    /// Partition base name, used as destination subdirectory. `None` for a
    /// whole-device volume.
    pub partition: Option<String>,
}

impl Volume {
    pub fn whole_device(address: &Path) -> Self {
        Self {
            address: address.to_path_buf(),
            partition: None,
        }
    }

    pub fn partition(address: &Path) -> Self {
        Self {
            address: address.to_path_buf(),
            partition: Some(base_name(address)),
        }
    }

    /// Root of this volume's files inside the run destination.
    pub fn destination(&self, run: &BackupRun) -> PathBuf {
        match &self.partition {
            Some(name) => run.destination.join(name),
            None => run.destination.clone(),
        }
    }
}

/// Classification of one directory entry during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEntry {
    Directory,
    RegularFile,
    Symlink,
    /// Dotfile filtered out by policy.
    Hidden,
    /// Sockets, FIFOs and device nodes are never captured.
    Special,
}

impl TreeEntry {
    pub fn classify(name: &OsStr, file_type: std::fs::FileType, copy_dotfiles: bool) -> Self {
        if is_hidden(name) && !copy_dotfiles {
            Self::Hidden
        } else if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_file() {
            Self::RegularFile
        } else {
            Self::Special
        }
    }
}

pub fn is_hidden(name: &OsStr) -> bool {
    name.as_encoded_bytes().first() == Some(&b'.')
}

/// One verified copy. Append-only; the dedup index is built from these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub digest: Digest,
    pub backup_timestamp: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
}

/// Last path component as a label, e.g. `/dev/sdb1` -> `sdb1`.
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
