//! Places single files and symlinks into a run's destination tree.
//!
//! A file is only considered placed once its destination digest matches the
//! digest taken from the source right before copying. Up to
//! `retry_attempts` hash-copy-verify cycles are made; a destination that
//! failed verification is removed so no corrupt copy stays behind.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::context::AppContext;
use crate::core::error::{BackupError, Result, is_device_removed_error};
use crate::core::hasher::{self, Digest};
use crate::core::models::{BackupRun, FileRecord};
use crate::core::progress::{ProgressKind, ProgressSink};

/// How a regular file ended up in the destination tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Bytes copied and verified.
    Copied {
        digest: Digest,
        attempts: u32,
        /// False when the dedup index could not be updated.
        recorded: bool,
    },
    /// Hard link to an identical file already in the store.
    Linked { existing: PathBuf },
}

pub struct CopyEngine<'a> {
    ctx: &'a AppContext,
    run: &'a BackupRun,
    progress: &'a ProgressSink,
}

impl<'a> CopyEngine<'a> {
    pub fn new(ctx: &'a AppContext, run: &'a BackupRun, progress: &'a ProgressSink) -> Self {
        Self { ctx, run, progress }
    }

    /// Copy (or link) `source_root/subdir/name` to `dest_root/subdir/name`.
    pub fn place_file(
        &self,
        dest_root: &Path,
        source_root: &Path,
        subdir: &Path,
        name: &OsStr,
    ) -> Result<Placement> {
        let source = source_root.join(subdir).join(name);
        let dest_dir = dest_root.join(subdir);
        if let Err(e) = self.ctx.fs.make_directories(&dest_dir) {
            let err = BackupError::io(&dest_dir, e);
            warn!(
                timestamp = %self.run.timestamp,
                source = %source.display(),
                error = %err,
                "Destination directory not created"
            );
            self.progress.emit(ProgressKind::CopyFailed {
                error: format!("Could not copy {}: {}", source.display(), err),
            });
            return Err(err);
        }
        let dest = dest_dir.join(name);

        let max_attempts = self.ctx.config.retry_attempts;
        let mut device_removed = false;

        for attempt in 1..=max_attempts {
            let size = match std::fs::symlink_metadata(&source) {
                Ok(m) => m.len(),
                Err(e) => {
                    device_removed |= is_device_removed_error(&e);
                    self.retrying(
                        BackupError::Hash { path: source.clone(), source: e },
                        attempt < max_attempts,
                    );
                    continue;
                }
            };
            let partial = hasher::is_partial(size);

            let pre = match hasher::digest(&source, partial) {
                Ok(d) => d,
                Err(e) => {
                    device_removed |= is_device_removed_error(&e);
                    self.retrying(
                        BackupError::Hash { path: source.clone(), source: e },
                        attempt < max_attempts,
                    );
                    continue;
                }
            };

            if self.ctx.config.hardlink {
                if let Some(existing) = self.link_existing(&pre, &dest) {
                    return Ok(Placement::Linked { existing });
                }
            }

            self.progress.emit(ProgressKind::Copying {
                source: source.clone(),
                destination: dest.clone(),
                attempt,
            });

            if let Err(e) = self.ctx.fs.copy(&source, &dest, true) {
                device_removed |= is_device_removed_error(&e);
                self.discard(&dest);
                self.retrying(BackupError::io(&source, e), attempt < max_attempts);
                continue;
            }

            let post = hasher::try_digest(&dest, partial);
            if post != Some(pre) {
                self.discard(&dest);
                self.retrying(
                    BackupError::VerificationMismatch {
                        source_path: source.clone(),
                        attempt,
                    },
                    attempt < max_attempts,
                );
                continue;
            }

            let recorded = self.record(pre, &source, &dest);
            self.progress.emit(ProgressKind::Copied {
                destination: dest,
                digest: pre,
            });
            return Ok(Placement::Copied {
                digest: pre,
                attempts: attempt,
                recorded,
            });
        }

        let err = BackupError::ExhaustedRetries {
            source_path: source,
            attempts: max_attempts,
            device_removed,
        };
        warn!(timestamp = %self.run.timestamp, error = %err, "Giving up on file");
        self.progress.emit(ProgressKind::CopyFailed {
            error: err.to_string(),
        });
        Err(err)
    }

    /// Recreate the symlink `source_root/subdir/name` without following it.
    pub fn place_symlink(
        &self,
        dest_root: &Path,
        source_root: &Path,
        subdir: &Path,
        name: &OsStr,
    ) -> Result<PathBuf> {
        let source = source_root.join(subdir).join(name);
        let dest_dir = dest_root.join(subdir);
        let dest = dest_dir.join(name);

        let result = self
            .ctx
            .fs
            .make_directories(&dest_dir)
            .and_then(|_| self.ctx.fs.read_symlink(&source))
            .and_then(|target| {
                self.ctx.fs.create_symlink(&target, &dest)?;
                Ok(target)
            });

        match result {
            Ok(target) => {
                self.progress.emit(ProgressKind::SymlinkCreated {
                    destination: dest,
                    target: target.clone(),
                });
                Ok(target)
            }
            Err(e) => {
                let err = BackupError::Link {
                    source_path: source,
                    destination: dest,
                    source: e,
                };
                warn!(timestamp = %self.run.timestamp, error = %err, "Symlink not recreated");
                self.progress.emit(ProgressKind::LinkFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Hard-link `dest` to stored content with the same digest, if any.
    fn link_existing(&self, digest: &Digest, dest: &Path) -> Option<PathBuf> {
        let existing = match self.ctx.index.lookup(digest) {
            Ok(found) => found?,
            Err(e) => {
                warn!(error = %e, "Dedup lookup failed, copying instead");
                return None;
            }
        };

        match self.ctx.fs.hardlink(&existing, dest) {
            Ok(()) => {
                self.progress.emit(ProgressKind::Linked {
                    existing: existing.clone(),
                    destination: dest.to_path_buf(),
                });
                Some(existing)
            }
            Err(e) => {
                debug!(
                    existing = %existing.display(),
                    dest = %dest.display(),
                    error = %e,
                    "Hard link failed, falling back to copy"
                );
                None
            }
        }
    }

    fn record(&self, digest: Digest, source: &Path, dest: &Path) -> bool {
        let record = FileRecord {
            digest,
            backup_timestamp: self.run.timestamp.clone(),
            source_path: source.to_path_buf(),
            destination_path: dest.to_path_buf(),
        };

        match self.ctx.index.record(record) {
            Ok(()) => true,
            Err(e) => {
                let err = BackupError::RecordStore {
                    destination: dest.to_path_buf(),
                    message: e.to_string(),
                };
                warn!(timestamp = %self.run.timestamp, error = %err, "File copied but not indexed");
                self.progress.emit(ProgressKind::RecordFailed {
                    error: err.to_string(),
                });
                false
            }
        }
    }

    /// The final failed attempt is reported once, as `CopyFailed`.
    fn retrying(&self, err: BackupError, will_retry: bool) {
        debug!(timestamp = %self.run.timestamp, error = %err, will_retry, "Copy attempt failed");
        if will_retry {
            self.progress.emit(ProgressKind::Retrying {
                error: err.to_string(),
            });
        }
    }

    fn discard(&self, dest: &Path) {
        if let Err(e) = std::fs::remove_file(dest) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dest = %dest.display(), error = %e, "Failed to remove unverified copy");
            }
        }
    }
}
