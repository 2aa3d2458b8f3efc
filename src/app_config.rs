//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use thiserror::Error;
use tracing::{debug, info};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn drive_fs_runtime_dir() -> Option<PathBuf> {
    let runtime_dir = dirs::runtime_dir();
    if let Some(path) = runtime_dir {
        return Some(path.join("drive-fs"));
    }

    let home_dir = dirs::home_dir();
    if let Some(path) = home_dir {
        return Some(path.join(".local").join("share").join("drive-fs"));
    }

    None
}

fn default_pid_file() -> PathBuf {
    drive_fs_runtime_dir().map_or_else(
        || PathBuf::from("/var/run/drive-fs.pid"),
        |rd| rd.join("drive-fs.pid"),
    )
}

fn default_mount_point() -> PathBuf {
    drive_fs_runtime_dir().map_or_else(|| PathBuf::from("/tmp/drive-fs/mnt"), |rd| rd.join("mnt"))
}

fn default_mirror_root() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from("/tmp/drive-fs/mirror"), |h| h.join("Drive"))
}

const fn default_request_timeout_secs() -> u64 {
    30
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

/// The cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// The path to the cache directory. Wiped on every start.
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: drive_fs_runtime_dir()
                .map_or_else(|| PathBuf::from("/tmp/drive-fs/cache"), |rd| rd.join("cache")),
        }
    }
}

/// Where remote objects come from, and how long to wait for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteConfig {
    /// The local directory served as the remote store.
    #[serde(default = "default_mirror_root")]
    pub mirror_root: PathBuf,

    /// Deadline for a single kernel request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl RemoteConfig {
    /// The per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            mirror_root: default_mirror_root(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// The path to the PID file for the daemon. Uses /var/run/drive-fs.pid if not specified.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Where the daemon writes its logs. Logs are discarded if not specified.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: None,
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// The user to mount the filesystem as. If not specified, runs as the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group to mount the filesystem as. If not specified, runs as the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            remote: RemoteConfig::default(),
            daemon: DaemonConfig::default(),
            mount_point: default_mount_point(),
            uid: current_uid(),
            gid: current_gid(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parent directory does not exist.")]
    NoParentDir,

    #[error("No suitable configuration path found.")]
    NoSuitableConfigPath,
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "PID file path '{}' has no parent directory.",
                self.daemon.pid_file.display()
            ));
        }

        if self.remote.request_timeout_secs == 0 {
            errors.push("request-timeout-secs must be at least 1.".to_owned());
        }

        if self.cache.path.starts_with(&self.mount_point) {
            errors.push(format!(
                "Cache path '{}' lies inside the mount point.",
                self.cache.path.display()
            ));
        }

        if self.remote.mirror_root.starts_with(&self.mount_point) {
            errors.push(format!(
                "Mirror root '{}' lies inside the mount point.",
                self.remote.mirror_root.display()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("drive-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("drive-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/drive-fs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config or creates a default if none exists.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_create(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(res) = Self::load(external_config_path) {
            let config = res?;
            if let Err(validation_errors) = config.validate() {
                return Err(ConfigError::ValidationErrors(validation_errors));
            }
            debug!("Loaded configuration successfully.");
            return Ok(config);
        }

        // No config exists, create the default at the highest-priority path.
        let creation_path = Self::config_search_paths()
            .into_iter()
            .next()
            .ok_or(ConfigError::NoSuitableConfigPath)?;

        let config = Self::default();
        config.write_to_disk(&creation_path)?;
        info!(path = ?creation_path.display(), "Created configuration file.");
        Ok(config)
    }

    fn write_to_disk(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::create_dir_all(path.parent().ok_or(ConfigError::NoParentDir)?)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn empty_file_takes_every_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.remote.request_timeout_secs, 30);
        assert_eq!(config.uid, current_uid());
        assert!(config.daemon.log_file.is_none());
    }

    #[test]
    fn kebab_case_keys_are_read() {
        let config: Config = toml::from_str(
            r#"
            mount-point = "/mnt/drive"

            [remote]
            mirror-root = "/srv/drive"
            request-timeout-secs = 5

            [cache]
            path = "/var/cache/drive-fs"
            "#,
        )
        .unwrap();
        assert_eq!(config.mount_point, PathBuf::from("/mnt/drive"));
        assert_eq!(config.remote.mirror_root, PathBuf::from("/srv/drive"));
        assert_eq!(config.remote.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.cache.path, PathBuf::from("/var/cache/drive-fs"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cache_inside_mount_point_is_rejected() {
        let config = Config {
            mount_point: PathBuf::from("/mnt/drive"),
            cache: CacheConfig {
                path: PathBuf::from("/mnt/drive/.cache"),
            },
            ..Config::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = Config {
            mount_point: PathBuf::from("/mnt/drive"),
            ..Config::default()
        };
        config.remote.request_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_survive_a_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::default();
        config.write_to_disk(&path).unwrap();
        let loaded = Config::load(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded, config);
    }
}
