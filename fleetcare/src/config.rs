//! Application configuration.
//!
//! [`AppConfig`] is built once at startup from a TOML file, then patched by
//! environment overrides, and handed to the registry and orchestrator by
//! value. Every field has a default so an absent file is not an error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::transport::config::HostKeyVerification;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "APP_CONFIG";

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/app_config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub remote: RemoteLayout,
    pub operations: OperationsConfig,
    pub ssh: SshSettings,
    pub logging: LoggingConfig,
}

/// Local filesystem locations.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Device inventory file.
    pub devices_file: PathBuf,

    /// Base directory for downloaded log archives.
    pub download_dir: PathBuf,

    /// Folder holding the current release artifacts.
    pub master_payload_dir: PathBuf,

    /// Local copy of the demo NVRAM sentinel.
    pub local_demo_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            devices_file: PathBuf::from("config/devices.toml"),
            download_dir: PathBuf::from("DownloadedLogs"),
            master_payload_dir: PathBuf::from("MasterPayload"),
            local_demo_file: PathBuf::from("config/Demo.dat"),
        }
    }
}

/// Where things live on the devices, and the commands used to change them.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteLayout {
    /// Log directories fetched by download_logs, transient area first.
    pub log_roots: Vec<String>,

    /// Release artifact directory (flash).
    pub payload_dir: String,

    /// NVRAM directory.
    pub nvram_dir: String,

    /// Remount command; `{path}` is replaced with the mount point.
    pub remount_command: String,

    /// Reboot command.
    pub reboot_command: String,

    /// Manifest written next to downloaded logs.
    pub manifest_name: String,

    /// Sentinel marking a demo-configured NVRAM.
    pub demo_file_name: String,

    /// Suffixes of release artifacts (manifest and update).
    pub artifact_extensions: Vec<String>,

    /// Suffixes considered by compare_file_versions.
    pub compare_extensions: Vec<String>,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self {
            log_roots: vec!["/tmp/logs".to_string(), "/mnt/log".to_string()],
            payload_dir: "/mnt/flash".to_string(),
            nvram_dir: "/mnt/nvram".to_string(),
            remount_command: "mount {path} -o remount,rw".to_string(),
            reboot_command: "reboot".to_string(),
            manifest_name: "PAYLOAD.txt".to_string(),
            demo_file_name: "Demo.dat".to_string(),
            artifact_extensions: vec![".iso".to_string(), ".sig".to_string()],
            compare_extensions: vec![".iso".to_string()],
        }
    }
}

impl RemoteLayout {
    /// Remount command for a mount point.
    pub fn remount(&self, path: &str) -> String {
        self.remount_command.replace("{path}", path)
    }

    /// Whether a file name is a release artifact.
    pub fn is_artifact(&self, name: &str) -> bool {
        has_suffix(name, &self.artifact_extensions)
    }

    /// Whether a file name takes part in version comparison.
    pub fn is_compared(&self, name: &str) -> bool {
        has_suffix(name, &self.compare_extensions)
    }
}

fn has_suffix(name: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|s| name.ends_with(s.as_str()))
}

/// Behaviour switches for the orchestrator and executor.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OperationsConfig {
    /// Ask before starting each operation.
    pub confirm_each_operation: bool,

    /// Ask before rebooting each device.
    pub confirm_before_reboot: bool,

    /// Re-list the payload directory after an update and compare with master.
    pub verify_after_update: bool,

    /// Devices processed at the same time within one operation.
    pub max_concurrent_devices: usize,

    /// Per-transfer limit in bytes per second; 0 is unlimited.
    pub transfer_rate_limit: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            confirm_each_operation: false,
            confirm_before_reboot: true,
            verify_after_update: true,
            max_concurrent_devices: 1,
            transfer_rate_limit: 0,
        }
    }
}

impl OperationsConfig {
    /// Concurrency limit, never below one.
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_devices.max(1)
    }
}

/// SSH connection settings shared by all devices.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    /// Default SSH port; devices may override it.
    pub port: u16,

    /// Connect and inactivity timeout in seconds.
    pub timeout_secs: u64,

    /// Host key policy.
    pub host_key_verification: HostKeyVerification,

    /// known_hosts file; `None` uses the user's default.
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: 22,
            timeout_secs: 30,
            host_key_verification: HostKeyVerification::Disabled,
            known_hosts_path: None,
        }
    }
}

impl SshSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Logging output for the binary.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is unset.
    pub level: String,

    /// Write logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl AppConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load from a file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let config = Self::from_toml_str(&text, path)?;
                info!("Configuration loaded from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Load from `APP_CONFIG` (or the default path) and apply environment
    /// overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::load(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    ///
    /// Variable names match the legacy `.env` file.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set_path = |var: &str, target: &mut PathBuf| {
            if let Some(value) = lookup(var) {
                debug!("Override from {var}: {value}");
                *target = PathBuf::from(value);
            }
        };
        set_path("DOWNLOAD_PATH", &mut self.paths.download_dir);
        set_path("MASTER_PAYLOAD_FOLDER", &mut self.paths.master_payload_dir);
        set_path("CONFIG_FILE", &mut self.paths.devices_file);
        set_path("LOCAL_DEMO_PATH", &mut self.paths.local_demo_file);

        if let Some(value) = lookup("LOG_PATH") {
            debug!("Override from LOG_PATH: {value}");
            self.logging.file = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("NVRAM_PATH") {
            debug!("Override from NVRAM_PATH: {value}");
            self.remote.nvram_dir = value;
        }
        if let Some(value) = lookup("FLASH_PATH") {
            debug!("Override from FLASH_PATH: {value}");
            self.remote.payload_dir = value;
        }
    }
}
