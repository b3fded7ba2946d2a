//! TOML-based persistence for daemon settings and per-device configuration.
//!
//! Everything lives in one file, `devices.toml`, in the platform config
//! directory:
//! - Linux:    `$XDG_CONFIG_HOME/serial-bridge/devices.toml` (or `~/.config/...`)
//! - macOS:    `~/Library/Application Support/SerialBridge/devices.toml`
//!
//! The `[daemon]` table holds process-wide settings; the `[devices]` table
//! maps device path to its [`DeviceConfiguration`]. The on-disk format is
//! an implementation detail of this module — no other process reads it.
//!
//! # Fail-soft loading
//!
//! A corrupt or unreadable store must never prevent daemon startup: the
//! in-memory state is authoritative for the running process and
//! persistence is best-effort. `ConfigStore::open` therefore logs and
//! falls back to defaults on any load failure, and `save` failures are
//! logged by the caller without rolling back the in-memory mutation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use bridge_core::DeviceConfiguration;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// On-disk layout of `devices.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub daemon: DaemonSettings,
    /// Device path → persisted configuration. A `BTreeMap` keeps the file
    /// (and every list derived from it) in stable path order.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfiguration>,
}

/// Process-wide daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonSettings {
    /// Lowest TCP port handed to bridge sessions.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Unix socket path the IPC listener binds.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Directory scanned for serial device nodes.
    #[serde(default = "default_watch_dir")]
    pub watch_dir: PathBuf,
    /// Executable spawned for each bridge session.
    #[serde(default = "default_bridge_command")]
    pub bridge_command: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_base_port() -> u16 {
    7501
}
fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/serial-bridge.sock")
}
fn default_watch_dir() -> PathBuf {
    PathBuf::from("/dev")
}
fn default_bridge_command() -> String {
    "serial-bridge-proxy".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            socket_path: default_socket_path(),
            watch_dir: default_watch_dir(),
            bridge_command: default_bridge_command(),
            log_level: default_log_level(),
        }
    }
}

// ── Config store ──────────────────────────────────────────────────────────────

/// Handle to the persisted store: remembers where the file lives and the
/// daemon settings loaded at startup, and rewrites the file on every
/// device-configuration mutation.
pub struct ConfigStore {
    path: PathBuf,
    settings: DaemonSettings,
}

impl ConfigStore {
    /// Opens the store at `path`, returning the store handle and the
    /// persisted device map.
    ///
    /// Never fails: a missing file yields defaults, and a corrupt or
    /// unreadable file is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> (Self, BTreeMap<String, DeviceConfiguration>) {
        let path = path.into();
        let file = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<ConfigFile>(&content) {
                Ok(file) => file,
                Err(e) => {
                    warn!("config at {} is corrupt, starting empty: {e}", path.display());
                    ConfigFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigFile::default(),
            Err(e) => {
                warn!("cannot read config at {}, starting empty: {e}", path.display());
                ConfigFile::default()
            }
        };

        let store = Self {
            path,
            settings: file.daemon,
        };
        (store, file.devices)
    }

    /// The daemon settings loaded at startup.
    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Persists the device map (together with the daemon settings) to disk.
    ///
    /// Creates the config directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system failures or
    /// [`ConfigError::Serialize`] if serialization fails. Callers log and
    /// continue; the in-memory map stays authoritative.
    pub fn save(&self, devices: &BTreeMap<String, DeviceConfiguration>) -> Result<(), ConfigError> {
        let file = ConfigFile {
            daemon: self.settings.clone(),
            devices: devices.clone(),
        };

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let content = toml::to_string_pretty(&file)?;
        std::fs::write(&self.path, content).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Resolves the full path to the config file in the platform config dir.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the base directory
/// cannot be determined from the environment.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("devices.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the platform config base directory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("serial-bridge"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("SerialBridge")
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_config_path() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bridge_test_{}", Uuid::new_v4()));
        dir.join("devices.toml")
    }

    #[test]
    fn test_open_missing_file_yields_defaults() {
        let path = temp_config_path();
        let (store, devices) = ConfigStore::open(&path);

        assert!(devices.is_empty());
        assert_eq!(store.settings().base_port, 7501);
        assert_eq!(store.settings().bridge_command, "serial-bridge-proxy");
    }

    #[test]
    fn test_open_corrupt_file_yields_defaults_not_error() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let (_store, devices) = ConfigStore::open(&path);
        assert!(devices.is_empty(), "corrupt store must degrade to empty");

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_save_then_open_round_trips_devices() {
        let path = temp_config_path();
        let (store, _) = ConfigStore::open(&path);

        let mut devices = BTreeMap::new();
        devices.insert(
            "ttyUSB0".to_string(),
            DeviceConfiguration {
                enabled: true,
                baud_rate: 115200,
            },
        );
        store.save(&devices).expect("save");

        let (_store2, restored) = ConfigStore::open(&path);
        assert_eq!(restored, devices);

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_save_creates_missing_parent_directory() {
        let path = temp_config_path();
        assert!(!path.parent().unwrap().exists());

        let (store, _) = ConfigStore::open(&path);
        store.save(&BTreeMap::new()).expect("save");
        assert!(path.exists());

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_deserialize_minimal_toml_uses_defaults() {
        let file: ConfigFile = toml::from_str("").expect("empty config is valid");
        assert_eq!(file.daemon.base_port, 7501);
        assert_eq!(file.daemon.watch_dir, PathBuf::from("/dev"));
        assert!(file.devices.is_empty());
    }

    #[test]
    fn test_deserialize_partial_daemon_table_overrides_defaults() {
        let toml_str = r#"
[daemon]
base_port = 9000

[devices.ttyUSB0]
enabled = true
"#;
        let file: ConfigFile = toml::from_str(toml_str).expect("deserialize partial");
        assert_eq!(file.daemon.base_port, 9000);
        // Unspecified fields keep their defaults
        assert_eq!(file.daemon.log_level, "info");
        let dev = &file.devices["ttyUSB0"];
        assert!(dev.enabled);
        assert_eq!(dev.baud_rate, bridge_core::DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_device_map_serializes_in_path_order() {
        let mut devices = BTreeMap::new();
        devices.insert("ttyUSB1".to_string(), DeviceConfiguration::default());
        devices.insert("ttyACM0".to_string(), DeviceConfiguration::default());

        let file = ConfigFile {
            daemon: DaemonSettings::default(),
            devices,
        };
        let toml_str = toml::to_string_pretty(&file).unwrap();
        let acm = toml_str.find("ttyACM0").unwrap();
        let usb = toml_str.find("ttyUSB1").unwrap();
        assert!(acm < usb);
    }
}
