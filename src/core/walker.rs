//! Recursive walk of a mounted volume.
//!
//! Symlinks are recreated rather than followed, so the walk cannot loop.
//! Errors on individual entries are counted and reported; the walk always
//! continues with the remaining entries.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::core::copy_engine::{CopyEngine, Placement};
use crate::core::models::TreeEntry;
use crate::core::progress::{ProgressKind, ProgressSink};

/// Outcome counters for one or more walks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WalkStats {
    pub copied: u64,
    pub linked: u64,
    pub symlinks: u64,
    pub skipped_hidden: u64,
    pub skipped_special: u64,
    /// Copied but missing from the dedup index.
    pub unindexed: u64,
    pub failed_files: Vec<PathBuf>,
    pub failed_links: Vec<PathBuf>,
    pub unreadable: Vec<PathBuf>,
}

impl WalkStats {
    pub fn failures(&self) -> usize {
        self.failed_files.len() + self.failed_links.len() + self.unreadable.len()
    }

    pub fn merge(&mut self, other: WalkStats) {
        self.copied += other.copied;
        self.linked += other.linked;
        self.symlinks += other.symlinks;
        self.skipped_hidden += other.skipped_hidden;
        self.skipped_special += other.skipped_special;
        self.unindexed += other.unindexed;
        self.failed_files.extend(other.failed_files);
        self.failed_links.extend(other.failed_links);
        self.unreadable.extend(other.unreadable);
    }
}

/// Path of `path` relative to `root`, compared component-wise.
///
/// `/mnt/sda1/x` is *not* under `/mnt/sda`, even though the strings share a
/// prefix.
pub fn relative_subdir(root: &Path, path: &Path) -> Option<PathBuf> {
    path.strip_prefix(root).ok().map(Path::to_path_buf)
}

pub struct TreeWalker<'a> {
    engine: &'a CopyEngine<'a>,
    progress: &'a ProgressSink,
    copy_dotfiles: bool,
}

impl<'a> TreeWalker<'a> {
    pub fn new(engine: &'a CopyEngine<'a>, progress: &'a ProgressSink, copy_dotfiles: bool) -> Self {
        Self {
            engine,
            progress,
            copy_dotfiles,
        }
    }

    /// Capture everything under `source_root` into `dest_root`.
    pub fn walk(&self, source_root: &Path, dest_root: &Path) -> WalkStats {
        let mut stats = WalkStats::default();
        self.walk_dir(source_root, source_root, dest_root, &mut stats);
        stats
    }

    fn walk_dir(&self, source_root: &Path, dir: &Path, dest_root: &Path, stats: &mut WalkStats) {
        let Some(subdir) = relative_subdir(source_root, dir) else {
            warn!(dir = %dir.display(), root = %source_root.display(), "Directory outside walk root");
            stats.unreadable.push(dir.to_path_buf());
            return;
        };

        let mut entries = match fs::read_dir(dir) {
            Ok(iter) => iter.filter_map(|e| self.readable(e, dir, stats)).collect::<Vec<_>>(),
            Err(e) => {
                self.unreadable(dir, &e, stats);
                return;
            }
        };
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    self.unreadable(&path, &e, stats);
                    continue;
                }
            };

            match TreeEntry::classify(&name, file_type, self.copy_dotfiles) {
                TreeEntry::Hidden => {
                    stats.skipped_hidden += 1;
                    self.progress.emit(ProgressKind::SkippedHidden { path });
                }
                TreeEntry::Symlink => {
                    match self
                        .engine
                        .place_symlink(dest_root, source_root, &subdir, &name)
                    {
                        Ok(_) => stats.symlinks += 1,
                        Err(_) => stats.failed_links.push(path),
                    }
                }
                TreeEntry::Directory => self.walk_dir(source_root, &path, dest_root, stats),
                TreeEntry::RegularFile => {
                    match self.engine.place_file(dest_root, source_root, &subdir, &name) {
                        Ok(Placement::Copied { recorded, .. }) => {
                            stats.copied += 1;
                            if !recorded {
                                stats.unindexed += 1;
                            }
                        }
                        Ok(Placement::Linked { .. }) => stats.linked += 1,
                        Err(_) => stats.failed_files.push(path),
                    }
                }
                TreeEntry::Special => {
                    stats.skipped_special += 1;
                    self.progress.emit(ProgressKind::SkippedSpecial { path });
                }
            }
        }
    }

    fn readable(
        &self,
        entry: std::io::Result<fs::DirEntry>,
        dir: &Path,
        stats: &mut WalkStats,
    ) -> Option<fs::DirEntry> {
        match entry {
            Ok(e) => Some(e),
            Err(e) => {
                self.unreadable(dir, &e, stats);
                None
            }
        }
    }

    fn unreadable(&self, path: &Path, error: &std::io::Error, stats: &mut WalkStats) {
        warn!(path = %path.display(), error = %error, "Skipping unreadable entry");
        self.progress.emit(ProgressKind::CopyFailed {
            error: format!("Could not read {}: {}", path.display(), error),
        });
        stats.unreadable.push(path.to_path_buf());
    }
}
