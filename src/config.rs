use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::core::fs_ops::{MountOptions, SupportedFilesystem};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/devsnap/config.toml";
pub const ENV_PREFIX: &str = "DEVSNAP_";

/// Daemon configuration. Loaded once at startup, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root of the backup store: `<backup_directory>/<timestamp>/<disk>/...`
    pub backup_directory: PathBuf,
    /// Where devices are mounted while being captured.
    pub mount_directory: PathBuf,
    /// Record store location. Defaults to `<backup_directory>/devsnap.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Glob patterns naming whole-disk device nodes, e.g. `/dev/sd?`.
    pub device_patterns: Vec<String>,
    /// Devices never backed up (system disks).
    pub blacklist: BTreeSet<PathBuf>,
    /// Hard-link files whose content is already in the store.
    pub hardlink: bool,
    /// Capture dotfiles and dot-directories.
    pub copy_dotfiles: bool,
    pub min_free_inodes: u64,
    pub min_free_bytes: u64,
    pub verbose: bool,
    pub debug: bool,
    pub log_json: bool,
    /// Treat device patterns as plain directories instead of block devices.
    pub simulation: bool,
    /// Filesystem types tried in order when mounting.
    pub filesystem_types: Vec<String>,
    pub poll_interval_secs: u64,
    pub debounce_secs: u64,
    pub settle_secs: u64,
    /// Total hash-copy-verify attempts per file.
    pub retry_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backup_directory: PathBuf::from("/var/lib/devsnap/backups"),
            mount_directory: PathBuf::from("/run/devsnap/mnt"),
            database_path: None,
            device_patterns: vec![
                "/dev/sd?".to_string(),
                "/dev/mmcblk?".to_string(),
                "/dev/da?".to_string(),
            ],
            blacklist: BTreeSet::new(),
            hardlink: true,
            copy_dotfiles: false,
            min_free_inodes: 10_000,
            min_free_bytes: 1024 * 1024 * 1024,
            verbose: false,
            debug: false,
            log_json: false,
            simulation: false,
            filesystem_types: SupportedFilesystem::DEFAULT_ORDER
                .iter()
                .map(|fs| fs.as_str().to_string())
                .collect(),
            poll_interval_secs: 3,
            debounce_secs: 3,
            settle_secs: 2,
            retry_attempts: 3,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `DEVSNAP_*` environment variables and
    /// finally command-line overrides.
    pub fn load<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration ({})", file.display()))?;

        if config.retry_attempts == 0 {
            anyhow::bail!("retry_attempts must be at least 1");
        }

        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.backup_directory.join("devsnap.db"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    /// Read-only mount options with the configured filesystem hints.
    pub fn mount_options(&self) -> MountOptions {
        let hints = self
            .filesystem_types
            .iter()
            .filter_map(|name| {
                let fs = SupportedFilesystem::parse(name);
                if fs.is_none() {
                    warn!(filesystem = %name, "Ignoring unsupported filesystem type");
                }
                fs
            })
            .collect();
        MountOptions::read_only(hints)
    }
}
