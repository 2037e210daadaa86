//! Configuration management for the virtual keyboard
//!
//! The cadence of the emulated key and the identity the device advertises can
//! be overridden from a TOML file. Every value defaults to the reference
//! behavior: first press after 10 s, one press per second, key held for
//! 200 ms, shut down after 10 cycles.
//!
//! ## Config File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/virtual-keyboard/config.toml` |
//! | macOS | `~/Library/Application Support/virtual-keyboard/config.toml` |
//! | Windows | `%APPDATA%\virtual-keyboard\config.toml` |
//!
//! ## Example
//!
//! ```no_run
//! use virtual_keyboard::Config;
//!
//! // Load existing config or use defaults
//! let mut config = Config::load().unwrap_or_default();
//!
//! // Modify settings
//! config.cadence.cycle_limit = 3;
//!
//! // Save to disk
//! config.save().expect("Failed to save config");
//! ```

use crate::device::Cadence;
use crate::transport::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Delay before the first key press, in milliseconds
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 10_000;
/// Interval between key presses, in milliseconds
pub const DEFAULT_PERIOD_MS: u64 = 1_000;
/// How long the key is held, in milliseconds
pub const DEFAULT_RELEASE_DELAY_MS: u64 = 200;
/// Number of press/release cycles before the device shuts down
pub const DEFAULT_CYCLE_LIMIT: u32 = 10;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to determine config directory
    NoConfigDir,
    /// IO error reading or writing config file
    Io(io::Error),
    /// Failed to parse config file
    Parse(toml::de::Error),
    /// Failed to serialize config
    Serialize(toml::ser::Error),
    /// Values that cannot drive a device
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoConfigDir => write!(f, "Could not determine config directory"),
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Returns the path to the config file.
///
/// Creates the config directory if it doesn't exist.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    let app_dir = config_dir.join("virtual-keyboard");

    if !app_dir.exists() {
        fs::create_dir_all(&app_dir)?;
    }

    Ok(app_dir.join("config.toml"))
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Press/release timing
    #[serde(default)]
    pub cadence: CadenceConfig,
    /// Advertised device identity and transport
    #[serde(default)]
    pub device: DeviceConfig,
}

/// Press/release timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CadenceConfig {
    /// Delay before the first press (in milliseconds)
    pub initial_delay_ms: u64,
    /// Interval between presses (in milliseconds)
    pub period_ms: u64,
    /// How long the key is held (in milliseconds)
    pub release_delay_ms: u64,
    /// Cycles before the device shuts itself down
    pub cycle_limit: u32,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            period_ms: DEFAULT_PERIOD_MS,
            release_delay_ms: DEFAULT_RELEASE_DELAY_MS,
            cycle_limit: DEFAULT_CYCLE_LIMIT,
        }
    }
}

impl CadenceConfig {
    /// Convert to the timing used by the device
    pub fn to_cadence(&self) -> Cadence {
        Cadence {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            period: Duration::from_millis(self.period_ms),
            release_delay: Duration::from_millis(self.release_delay_ms),
            cycle_limit: self.cycle_limit,
        }
    }
}

/// Transport the device is exposed through
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Linux `/dev/uhid`
    #[default]
    Uhid,
    /// In-memory, reports are only logged
    Loopback,
}

/// Device identity configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name reported to the host
    pub name: String,
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Device version number
    pub version: u32,
    /// Transport backend
    pub backend: BackendKind,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let identity = DeviceIdentity::default();
        Self {
            name: identity.name,
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            version: identity.version,
            backend: BackendKind::default(),
        }
    }
}

impl DeviceConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: self.name.clone(),
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            version: self.version,
        }
    }
}

impl Config {
    /// Load configuration from the default config file.
    ///
    /// Returns the default configuration if the file doesn't exist.
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    ///
    /// Values are not validated here so that command line overrides can
    /// still be applied; call [`Config::validate`] on the final config.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to the default config file.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check that the cadence can drive a device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cadence = &self.cadence;
        if cadence.period_ms == 0 {
            return Err(ConfigError::Invalid("period_ms must be non-zero".to_string()));
        }
        if cadence.cycle_limit == 0 {
            return Err(ConfigError::Invalid(
                "cycle_limit must be at least 1".to_string(),
            ));
        }
        if cadence.release_delay_ms >= cadence.period_ms {
            return Err(ConfigError::Invalid(format!(
                "release_delay_ms ({}) must be shorter than period_ms ({})",
                cadence.release_delay_ms, cadence.period_ms
            )));
        }
        if self.device.name.is_empty() {
            return Err(ConfigError::Invalid("device name is empty".to_string()));
        }
        Ok(())
    }
}
