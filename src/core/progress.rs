//! Progress events flowing from disk workers back to the supervisor.
//!
//! Every worker holds a [`ProgressSink`] tagged with its device; the
//! supervisor owns the single receiving end and drains it each poll. The
//! channel is unbounded so a worker never blocks on a slow consumer, and
//! messages from one worker keep their order.

use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::core::hasher::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    /// Per-file diagnostics, only interesting when debugging.
    Debug,
    /// Per-file actions, shown in verbose mode.
    Verbose,
    /// Lifecycle messages always worth a line.
    Info,
    /// Something did not make it into the backup.
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressKind {
    RunStarted {
        timestamp: String,
        destination: PathBuf,
    },
    MountingVolume {
        address: PathBuf,
    },
    VolumeFailed {
        address: PathBuf,
        error: String,
    },
    Copying {
        source: PathBuf,
        destination: PathBuf,
        attempt: u32,
    },
    Copied {
        destination: PathBuf,
        digest: Digest,
    },
    Linked {
        existing: PathBuf,
        destination: PathBuf,
    },
    SymlinkCreated {
        destination: PathBuf,
        target: PathBuf,
    },
    SkippedHidden {
        path: PathBuf,
    },
    SkippedSpecial {
        path: PathBuf,
    },
    Retrying {
        error: String,
    },
    CopyFailed {
        error: String,
    },
    LinkFailed {
        error: String,
    },
    RecordFailed {
        error: String,
    },
    RunFinished {
        summary: String,
    },
}

impl ProgressKind {
    pub fn level(&self) -> EventLevel {
        match self {
            Self::RunStarted { .. } | Self::MountingVolume { .. } | Self::RunFinished { .. } => {
                EventLevel::Info
            }
            Self::Copying { .. }
            | Self::Copied { .. }
            | Self::Linked { .. }
            | Self::SymlinkCreated { .. } => EventLevel::Verbose,
            Self::SkippedHidden { .. } | Self::SkippedSpecial { .. } => EventLevel::Debug,
            Self::VolumeFailed { .. }
            | Self::Retrying { .. }
            | Self::CopyFailed { .. }
            | Self::LinkFailed { .. }
            | Self::RecordFailed { .. } => EventLevel::Warn,
        }
    }
}

impl fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunStarted {
                timestamp,
                destination,
            } => write!(f, "backup {} started -> {}", timestamp, destination.display()),
            Self::MountingVolume { address } => {
                write!(f, "mount and backup {}", address.display())
            }
            Self::VolumeFailed { address, error } => {
                write!(f, "volume {} failed: {}", address.display(), error)
            }
            Self::Copying {
                source,
                destination,
                attempt,
            } => write!(
                f,
                "copying {} -> {} (attempt {})",
                source.display(),
                destination.display(),
                attempt
            ),
            Self::Copied {
                destination,
                digest,
            } => write!(f, "copied {} [{:?}]", destination.display(), digest),
            Self::Linked {
                existing,
                destination,
            } => write!(f, "ln {} {}", existing.display(), destination.display()),
            Self::SymlinkCreated {
                destination,
                target,
            } => write!(f, "symlink {} -> {}", destination.display(), target.display()),
            Self::SkippedHidden { path } => write!(f, "skipping hidden {}", path.display()),
            Self::SkippedSpecial { path } => {
                write!(f, "skipping special file {}", path.display())
            }
            Self::Retrying { error } => write!(f, "{}, retrying", error),
            Self::CopyFailed { error } | Self::LinkFailed { error } => f.write_str(error),
            Self::RecordFailed { error } => write!(f, "durability warning: {}", error),
            Self::RunFinished { summary } => write!(f, "backup finished: {}", summary),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub device: String,
    pub kind: ProgressKind,
}

/// Sending half handed to a worker.
#[derive(Clone)]
pub struct ProgressSink {
    device: String,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink {
    pub fn new(device: impl Into<String>, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            device: device.into(),
            tx,
        }
    }

    /// Queue an event. A closed channel only means nobody is listening anymore.
    pub fn emit(&self, kind: ProgressKind) {
        let _ = self.tx.send(ProgressEvent {
            device: self.device.clone(),
            kind,
        });
    }
}

/// Create the progress channel.
pub fn channel() -> (
    mpsc::UnboundedSender<ProgressEvent>,
    mpsc::UnboundedReceiver<ProgressEvent>,
) {
    mpsc::unbounded_channel()
}

/// Pull everything currently queued without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
