//! Configuration file support for matflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MATFLASH_*)
//! 3. Local config file (./matflash.toml)
//! 4. Global config file (~/.config/matflash/config.toml)
//!
//! ```toml
//! [usb]
//! vid = 0x045B
//! pid = 0x0025
//! timeout_ms = 5000
//!
//! [image]
//! strict_size = false
//! fill = 0xFF
//! ```

use anyhow::Result;
use directories::ProjectDirs;
use log::{debug, warn};
use matflash::UsbConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::CliError;

/// Name of the local configuration file.
const LOCAL_CONFIG: &str = "matflash.toml";

/// USB device and endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UsbSection {
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// Interface number to claim.
    pub interface: Option<u8>,
    /// Configuration value to activate.
    pub configuration: Option<u8>,
    /// Bulk OUT endpoint address.
    pub endpoint_out: Option<u8>,
    /// Bulk IN endpoint address.
    pub endpoint_in: Option<u8>,
    /// Per-transfer timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Firmware image handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    /// Reject images that are not a multiple of the block size.
    #[serde(default)]
    pub strict_size: bool,
    /// Fill byte for padding the last block.
    pub fill: Option<u8>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// USB settings.
    #[serde(default)]
    pub usb: UsbSection,
    /// Image settings.
    #[serde(default)]
    pub image: ImageSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike the implicit locations, an explicit path must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content).map_err(|e| {
            CliError::Config(format!("Failed to parse config file {}: {e}", path.display()))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a specific file, warning about unusable files.
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
        ProjectDirs::from("", "", "matflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        let usb = &mut self.usb;
        usb.vid = other.usb.vid.or(usb.vid);
        usb.pid = other.usb.pid.or(usb.pid);
        usb.interface = other.usb.interface.or(usb.interface);
        usb.configuration = other.usb.configuration.or(usb.configuration);
        usb.endpoint_out = other.usb.endpoint_out.or(usb.endpoint_out);
        usb.endpoint_in = other.usb.endpoint_in.or(usb.endpoint_in);
        usb.timeout_ms = other.usb.timeout_ms.or(usb.timeout_ms);

        if other.image.strict_size {
            self.image.strict_size = true;
        }
        self.image.fill = other.image.fill.or(self.image.fill);
    }

    /// USB transport settings with library defaults for unset values.
    pub fn usb_config(&self) -> UsbConfig {
        let defaults = UsbConfig::default();
        UsbConfig {
            vid: self.usb.vid.unwrap_or(defaults.vid),
            pid: self.usb.pid.unwrap_or(defaults.pid),
            interface: self.usb.interface.unwrap_or(defaults.interface),
            configuration: self.usb.configuration.unwrap_or(defaults.configuration),
            endpoint_out: self.usb.endpoint_out.unwrap_or(defaults.endpoint_out),
            endpoint_in: self.usb.endpoint_in.unwrap_or(defaults.endpoint_in),
            timeout: self
                .usb
                .timeout_ms
                .map_or(defaults.timeout, Duration::from_millis),
            reset: defaults.reset,
        }
    }
}
