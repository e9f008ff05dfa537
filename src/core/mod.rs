pub mod copy_engine;
pub mod dedup;
pub mod error;
pub mod fs_ops;
pub mod hasher;
pub mod models;
pub mod mount;
pub mod progress;
pub mod supervisor;
pub mod walker;
pub mod watcher;
pub mod worker;

pub use copy_engine::{CopyEngine, Placement};
pub use dedup::{DedupIndex, SqliteDedupIndex};
pub use error::BackupError;
pub use fs_ops::{FreeSpace, FsOps, MountOptions, SupportedFilesystem};
pub use hasher::Digest;
pub use models::{BackupRun, FileRecord, Volume};
pub use supervisor::{Supervisor, WorkerExit};
pub use watcher::{DeviceProbe, DeviceWatcher, GlobProbe};
pub use worker::{BackupSummary, run_backup};
