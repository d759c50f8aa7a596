//! Configuration file support for ps280sync.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (PS280SYNC_*)
//! 3. Local config file (./ps280sync.toml)
//! 4. Global config file (~/.config/ps280sync/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use ps280sync::{
    FlashToolConfig, ParameterPolicy, ProtocolTiming, TransportConfig, UsbId,
    default_allow_list, port::DEFAULT_BAUD, sensor::DEFAULT_SU_PASSWORD,
    tool::DEFAULT_FLASH_BAUD,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "ps280sync.toml";

/// Default directory holding one subdirectory per firmware version.
pub const DEFAULT_FIRMWARE_DIR: &str = "firmware";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Console baud rate.
    pub baud: Option<u32>,
    /// Exchange timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Discovery rounds.
    pub max_retries: Option<usize>,
    /// Pause between discovery rounds in milliseconds.
    pub retry_delay_ms: Option<u64>,
    /// Extra USB devices accepted during discovery.
    #[serde(default)]
    pub usb_device: Vec<UsbId>,
}

/// Which parameters are left alone or need elevation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Keys (`GROUP.PARAM`) never written.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Keys (`GROUP.PARAM`) written only after `su`.
    #[serde(default)]
    pub superuser: Vec<String>,
    /// Superuser password.
    pub su_password: Option<String>,
}

/// Firmware configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Directory with one subdirectory per version.
    pub dir: Option<PathBuf>,
    /// Flashing tool executable; `python3 -m esptool` when unset.
    pub tool: Option<String>,
    /// Flashing baud rate.
    pub baud: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Parameter policy.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Firmware settings.
    #[serde(default)]
    pub firmware: FirmwareConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ps280sync").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    fn merge(&mut self, other: Self) {
        let conn = other.connection;
        if conn.serial.is_some() {
            self.connection.serial = conn.serial;
        }
        if conn.baud.is_some() {
            self.connection.baud = conn.baud;
        }
        if conn.timeout_ms.is_some() {
            self.connection.timeout_ms = conn.timeout_ms;
        }
        if conn.max_retries.is_some() {
            self.connection.max_retries = conn.max_retries;
        }
        if conn.retry_delay_ms.is_some() {
            self.connection.retry_delay_ms = conn.retry_delay_ms;
        }
        for device in conn.usb_device {
            if !self.connection.usb_device.contains(&device) {
                self.connection.usb_device.push(device);
            }
        }

        self.policy.ignore.extend(other.policy.ignore);
        self.policy.superuser.extend(other.policy.superuser);
        if other.policy.su_password.is_some() {
            self.policy.su_password = other.policy.su_password;
        }

        if other.firmware.dir.is_some() {
            self.firmware.dir = other.firmware.dir;
        }
        if other.firmware.tool.is_some() {
            self.firmware.tool = other.firmware.tool;
        }
        if other.firmware.baud.is_some() {
            self.firmware.baud = other.firmware.baud;
        }
    }

    /// Transport settings, with `port` and `baud` from the command line taking precedence.
    pub fn transport(&self, port: Option<&str>, baud: Option<u32>) -> TransportConfig {
        let mut allow_list = default_allow_list();
        for device in &self.connection.usb_device {
            if !allow_list.contains(device) {
                allow_list.push(*device);
            }
        }

        let mut config = TransportConfig::default().with_allow_list(allow_list);
        config.port = port
            .map(str::to_string)
            .or_else(|| self.connection.serial.clone());
        config.baud_rate = baud.or(self.connection.baud).unwrap_or(DEFAULT_BAUD);
        if let Some(retries) = self.connection.max_retries {
            config.max_retries = retries;
        }
        if let Some(delay) = self.connection.retry_delay_ms {
            config.retry_delay = Duration::from_millis(delay);
        }
        config
    }

    /// Protocol timing with the configured exchange timeout.
    pub fn timing(&self) -> ProtocolTiming {
        let mut timing = ProtocolTiming::default();
        if let Some(timeout) = self.connection.timeout_ms {
            timing.exchange_timeout = Duration::from_millis(timeout);
        }
        timing
    }

    /// Ignore and superuser lists.
    pub fn parameter_policy(&self) -> ParameterPolicy {
        ParameterPolicy::new()
            .with_ignored(self.policy.ignore.iter())
            .with_superuser(self.policy.superuser.iter())
    }

    /// Superuser password.
    pub fn su_password(&self) -> &str {
        self.policy
            .su_password
            .as_deref()
            .unwrap_or(DEFAULT_SU_PASSWORD)
    }

    /// Firmware root, with `dir` from the command line taking precedence.
    pub fn firmware_dir(&self, dir: Option<&Path>) -> PathBuf {
        dir.map(Path::to_path_buf)
            .or_else(|| self.firmware.dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FIRMWARE_DIR))
    }

    /// Flashing tool invocation for `port`.
    pub fn flash_tool(&self, port: Option<String>) -> FlashToolConfig {
        let base = match &self.firmware.tool {
            Some(program) => FlashToolConfig::program(program.as_str()),
            None => FlashToolConfig::default(),
        };
        base.with_baud(self.firmware.baud.unwrap_or(DEFAULT_FLASH_BAUD))
            .with_port(port)
    }
}
