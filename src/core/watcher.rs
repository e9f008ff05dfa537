//! Device discovery by polling glob patterns such as `/dev/sd?`.
//!
//! A device counts as attached when it shows up in a poll but was absent
//! from the previous one, is not blacklisted, and is still present after a
//! debounce delay.

use globset::Glob;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::core::error::{BackupError, Result};

/// Source of the current set of whole-disk device addresses.
pub trait DeviceProbe: Send + Sync {
    fn current_devices(&self) -> Result<BTreeSet<PathBuf>>;
}

/// Expands configured glob patterns against the filesystem.
pub struct GlobProbe {
    patterns: Vec<String>,
}

impl GlobProbe {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

impl DeviceProbe for GlobProbe {
    fn current_devices(&self) -> Result<BTreeSet<PathBuf>> {
        let mut devices = BTreeSet::new();
        for pattern in &self.patterns {
            devices.extend(expand_pattern(pattern)?);
        }
        Ok(devices)
    }
}

/// Expand a pattern whose last component may contain glob syntax.
pub fn expand_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let enumeration_error = |message: String| BackupError::DeviceEnumeration {
        pattern: pattern.to_string(),
        message,
    };

    let path = Path::new(pattern);
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(enumeration_error("pattern has no file name".to_string()));
    };
    if parent.to_string_lossy().contains(['*', '?', '[', '{']) {
        return Err(enumeration_error(
            "only the last path component may contain wildcards".to_string(),
        ));
    }

    let matcher = Glob::new(&name.to_string_lossy())
        .map_err(|e| enumeration_error(e.to_string()))?
        .compile_matcher();

    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(enumeration_error(e.to_string())),
    };

    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| matcher.is_match(e.file_name()))
        .map(|e| e.path())
        .collect();
    matches.sort();
    Ok(matches)
}

/// Partition nodes of `disk` among `nodes`: everything named `<disk>*`
/// except the disk itself, sorted.
pub fn partitions_of(disk: &Path, nodes: &[PathBuf]) -> Vec<PathBuf> {
    let prefix = disk.as_os_str().as_encoded_bytes();
    let mut partitions: Vec<PathBuf> = nodes
        .iter()
        .filter(|node| {
            let bytes = node.as_os_str().as_encoded_bytes();
            bytes.len() > prefix.len() && bytes.starts_with(prefix)
        })
        .cloned()
        .collect();
    partitions.sort();
    partitions
}

/// Partition nodes currently present next to `disk`.
pub fn get_partitions(disk: &Path) -> Result<Vec<PathBuf>> {
    let parent = disk.parent().unwrap_or(Path::new("/"));
    let nodes: Vec<PathBuf> = fs::read_dir(parent)
        .map_err(|e| BackupError::DeviceEnumeration {
            pattern: format!("{}*", disk.display()),
            message: e.to_string(),
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    Ok(partitions_of(disk, &nodes))
}

/// Result of one watcher poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub current: BTreeSet<PathBuf>,
    /// Newly attached devices that survived the debounce re-check.
    pub attached: Vec<PathBuf>,
}

pub struct DeviceWatcher {
    probe: Box<dyn DeviceProbe>,
    blacklist: BTreeSet<PathBuf>,
    debounce: Duration,
    known: BTreeSet<PathBuf>,
}

impl DeviceWatcher {
    pub fn new(probe: Box<dyn DeviceProbe>, blacklist: BTreeSet<PathBuf>, debounce: Duration) -> Self {
        Self {
            probe,
            blacklist,
            debounce,
            known: BTreeSet::new(),
        }
    }

    /// Record what is attached at startup. These devices are not backed up.
    pub fn prime(&mut self) -> Result<&BTreeSet<PathBuf>> {
        self.known = self.probe.current_devices()?;
        info!(devices = ?self.known, "Devices already present at startup");
        Ok(&self.known)
    }

    pub fn known(&self) -> &BTreeSet<PathBuf> {
        &self.known
    }

    /// Devices in `current` that were not seen last poll and are not blacklisted.
    pub fn newly_seen(&self, current: &BTreeSet<PathBuf>) -> Vec<PathBuf> {
        current
            .iter()
            .filter(|d| !self.known.contains(*d) && !self.blacklist.contains(*d))
            .cloned()
            .collect()
    }

    /// Poll, debounce new devices, and remember this poll's set.
    ///
    /// On enumeration failure the known set is left untouched, so the next
    /// successful poll does not mistake every device for a new one.
    pub async fn poll(&mut self) -> Result<Detection> {
        let current = self.probe.current_devices()?;
        debug!(devices = ?current, "Devices known");

        let candidates = self.newly_seen(&current);
        let mut attached = Vec::new();
        let mut flickered = BTreeSet::new();

        if !candidates.is_empty() {
            tokio::time::sleep(self.debounce).await;
            let recheck = self.probe.current_devices().unwrap_or_default();

            for device in candidates {
                if recheck.contains(&device) {
                    attached.push(device);
                } else {
                    debug!(device = %device.display(), "Device vanished during debounce");
                    flickered.insert(device);
                }
            }
        }

        // A device that flickered is reconsidered when it is seen again
        self.known = current.difference(&flickered).cloned().collect();

        Ok(Detection { current, attached })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Returns a fixed sequence of device sets, repeating the last one.
    struct ScriptedProbe {
        polls: Mutex<VecDeque<Vec<&'static str>>>,
    }

    impl ScriptedProbe {
        fn new(polls: Vec<Vec<&'static str>>) -> Box<Self> {
            Box::new(Self {
                polls: Mutex::new(polls.into()),
            })
        }
    }

    impl DeviceProbe for ScriptedProbe {
        fn current_devices(&self) -> Result<BTreeSet<PathBuf>> {
            let mut polls = self.polls.lock().unwrap();
            let next = if polls.len() > 1 {
                polls.pop_front().unwrap()
            } else {
                polls.front().cloned().unwrap_or_default()
            };
            Ok(next.into_iter().map(PathBuf::from).collect())
        }
    }

    fn paths(v: &[&str]) -> Vec<PathBuf> {
        v.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_partitions_exclude_the_disk_itself() {
        let nodes = paths(&["/dev/sda2", "/dev/sda", "/dev/sda1", "/dev/sdb"]);
        assert_eq!(
            partitions_of(Path::new("/dev/sda"), &nodes),
            paths(&["/dev/sda1", "/dev/sda2"])
        );
        assert!(partitions_of(Path::new("/dev/sdb"), &nodes).is_empty());
    }

    #[test]
    fn test_get_partitions_on_disk_nodes() {
        let temp = tempdir().unwrap();
        for name in ["sda", "sda1", "sda2", "sdb"] {
            std::fs::write(temp.path().join(name), b"").unwrap();
        }
        let disk = temp.path().join("sda");
        assert_eq!(
            get_partitions(&disk).unwrap(),
            vec![temp.path().join("sda1"), temp.path().join("sda2")]
        );
    }

    #[test]
    fn test_glob_probe_expands_and_sorts() {
        let temp = tempdir().unwrap();
        for name in ["sdc", "sda", "sda1", "mmcblk0", "loop0"] {
            std::fs::write(temp.path().join(name), b"").unwrap();
        }
        let probe = GlobProbe::new(vec![
            format!("{}/sd?", temp.path().display()),
            format!("{}/mmcblk?", temp.path().display()),
            format!("{}/missing-dir/sd?", temp.path().display()),
        ]);
        let devices: Vec<PathBuf> = probe.current_devices().unwrap().into_iter().collect();
        assert_eq!(
            devices,
            vec![
                temp.path().join("mmcblk0"),
                temp.path().join("sda"),
                temp.path().join("sdc"),
            ]
        );
    }

    #[test]
    fn test_wildcard_in_parent_is_rejected() {
        let err = expand_pattern("/dev/*/sd?").unwrap_err();
        assert!(matches!(err, BackupError::DeviceEnumeration { .. }));
    }

    #[tokio::test]
    async fn test_new_device_is_reported_once() {
        let probe = ScriptedProbe::new(vec![
            vec!["/dev/sda"],
            vec!["/dev/sda", "/dev/sdb"],
            vec!["/dev/sda", "/dev/sdb"],
            vec!["/dev/sda", "/dev/sdb"],
        ]);
        let mut watcher = DeviceWatcher::new(probe, BTreeSet::new(), Duration::ZERO);
        watcher.prime().unwrap();

        let first = watcher.poll().await.unwrap();
        assert_eq!(first.attached, paths(&["/dev/sdb"]));

        let second = watcher.poll().await.unwrap();
        assert!(second.attached.is_empty());
    }

    #[tokio::test]
    async fn test_flicker_does_not_trigger_backup() {
        let probe = ScriptedProbe::new(vec![
            vec![],
            vec!["/dev/sdb"],
            vec![],
            vec![],
        ]);
        let mut watcher = DeviceWatcher::new(probe, BTreeSet::new(), Duration::ZERO);
        watcher.prime().unwrap();

        let detection = watcher.poll().await.unwrap();
        assert_eq!(detection.current.len(), 1);
        assert!(detection.attached.is_empty());
        assert!(watcher.known().is_empty());

        assert!(watcher.poll().await.unwrap().attached.is_empty());
    }

    #[tokio::test]
    async fn test_blacklisted_device_is_ignored() {
        let probe = ScriptedProbe::new(vec![vec![], vec!["/dev/sda", "/dev/sdb"]]);
        let blacklist = [PathBuf::from("/dev/sda")].into_iter().collect();
        let mut watcher = DeviceWatcher::new(probe, blacklist, Duration::ZERO);
        watcher.prime().unwrap();

        assert_eq!(watcher.poll().await.unwrap().attached, paths(&["/dev/sdb"]));
    }

    #[tokio::test]
    async fn test_reattached_device_is_new_again() {
        let probe = ScriptedProbe::new(vec![
            vec![],
            vec!["/dev/sdb"],
            vec!["/dev/sdb"],
            vec![],
            vec!["/dev/sdb"],
            vec!["/dev/sdb"],
        ]);
        let mut watcher = DeviceWatcher::new(probe, BTreeSet::new(), Duration::ZERO);
        watcher.prime().unwrap();

        assert_eq!(watcher.poll().await.unwrap().attached, paths(&["/dev/sdb"]));
        assert!(watcher.poll().await.unwrap().attached.is_empty());
        assert_eq!(watcher.poll().await.unwrap().attached, paths(&["/dev/sdb"]));
    }
}
