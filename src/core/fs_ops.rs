use std::io;
use std::path::{Path, PathBuf};

/// Free space snapshot of the filesystem holding the backup store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpace {
    pub free_inodes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

/// Filesystems tried, in order, when the mount call cannot probe the type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFilesystem {
    Vfat,
    Exfat,
    Ntfs3,
    Ext4,
    Ext3,
    Ext2,
    Btrfs,
    Xfs,
    Hfsplus,
    Iso9660,
    Udf,
}

impl SupportedFilesystem {
    /// Default probe order, removable media formats first.
    pub const DEFAULT_ORDER: &'static [SupportedFilesystem] = &[
        Self::Vfat,
        Self::Exfat,
        Self::Ntfs3,
        Self::Ext4,
        Self::Ext3,
        Self::Ext2,
        Self::Btrfs,
        Self::Xfs,
        Self::Hfsplus,
        Self::Iso9660,
        Self::Udf,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "vfat" | "fat32" | "fat16" | "msdos" => Some(Self::Vfat),
            "exfat" => Some(Self::Exfat),
            "ntfs" | "ntfs3" => Some(Self::Ntfs3),
            "ext4" => Some(Self::Ext4),
            "ext3" => Some(Self::Ext3),
            "ext2" => Some(Self::Ext2),
            "btrfs" => Some(Self::Btrfs),
            "xfs" => Some(Self::Xfs),
            "hfsplus" | "hfs+" => Some(Self::Hfsplus),
            "iso9660" => Some(Self::Iso9660),
            "udf" => Some(Self::Udf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vfat => "vfat",
            Self::Exfat => "exfat",
            Self::Ntfs3 => "ntfs3",
            Self::Ext4 => "ext4",
            Self::Ext3 => "ext3",
            Self::Ext2 => "ext2",
            Self::Btrfs => "btrfs",
            Self::Xfs => "xfs",
            Self::Hfsplus => "hfsplus",
            Self::Iso9660 => "iso9660",
            Self::Udf => "udf",
        }
    }
}

/// How a volume should be mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    /// Ordered filesystem type hints. Empty means the adapter auto-detects.
    pub fstype_hints: Vec<SupportedFilesystem>,
}

impl MountOptions {
    pub fn read_only(fstype_hints: Vec<SupportedFilesystem>) -> Self {
        Self {
            read_only: true,
            fstype_hints,
        }
    }
}

/// OS primitives the backup core depends on.
///
/// Every failure surfaces as an `io::Error`; nothing is a silent no-op.
/// NOTE: All methods perform blocking I/O and must be called from a
/// blocking context (a worker thread or `spawn_blocking`).
pub trait FsOps: Send + Sync {
    fn mount(&self, device: &Path, target: &Path, options: &MountOptions) -> io::Result<()>;

    fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Copy file contents, preserving permissions and timestamps when asked.
    fn copy(&self, source: &Path, destination: &Path, preserve_attrs: bool) -> io::Result<u64>;

    fn hardlink(&self, existing: &Path, destination: &Path) -> io::Result<()>;

    fn read_symlink(&self, source: &Path) -> io::Result<PathBuf>;

    /// Create `destination` pointing at `target`, replacing any existing entry.
    fn create_symlink(&self, target: &Path, destination: &Path) -> io::Result<()>;

    fn make_directories(&self, path: &Path) -> io::Result<()>;

    fn remove_directory(&self, path: &Path) -> io::Result<()>;

    fn stat_free_space(&self, path: &Path) -> io::Result<FreeSpace>;

    /// Flush buffered writes to stable storage.
    fn sync(&self) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(SupportedFilesystem::parse("FAT32"), Some(SupportedFilesystem::Vfat));
        assert_eq!(SupportedFilesystem::parse("ntfs"), Some(SupportedFilesystem::Ntfs3));
        assert_eq!(SupportedFilesystem::parse("zfs"), None);
    }

    #[test]
    fn test_default_order_starts_with_removable_formats() {
        let order: Vec<&str> = SupportedFilesystem::DEFAULT_ORDER
            .iter()
            .map(|fs| fs.as_str())
            .collect();
        assert_eq!(&order[..3], &["vfat", "exfat", "ntfs3"]);
        for name in order {
            assert_eq!(SupportedFilesystem::parse(name).map(|f| f.as_str()), Some(name));
        }
    }
}
