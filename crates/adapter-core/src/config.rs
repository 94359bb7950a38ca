//! Configuration loading.
//!
//! A config file lists devices and logging options:
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "compact"
//!
//! [[devices]]
//! id = "pump"
//! type = "aladdin"
//! [devices.config]
//! port = "/dev/ttyUSB0"
//! pump_count = 1
//! ```
//!
//! Values are merged from the TOML file and `ADAPTERS_`-prefixed environment
//! variables (e.g. `ADAPTERS_LOGGING__LEVEL=trace`). Each device's `config`
//! table is handed unchanged to its driver factory, which deserializes it into
//! its own typed config that flattens a [`TransportConfig`].

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AdapterError, AdapterResult};
use crate::tracing_init::OutputFormat;
use crate::transport::{
    TransportSettings, DEFAULT_MAX_RESPONSE_BYTES, DEFAULT_PURGE_WINDOW, DEFAULT_TIMEOUT,
};

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML or wrong shape)
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Two devices share an id
    #[error("Duplicate device id '{0}'")]
    DuplicateId(String),
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_max_response_bytes() -> usize {
    DEFAULT_MAX_RESPONSE_BYTES
}

fn default_purge_window_ms() -> u64 {
    DEFAULT_PURGE_WINDOW.as_millis() as u64
}

/// Serial settings shared by every driver config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// Baud rate; drivers supply their device's default.
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Per-receive timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on a single reply.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    /// Drain window used by purge, in milliseconds.
    #[serde(default = "default_purge_window_ms")]
    pub purge_window_ms: u64,
}

impl TransportConfig {
    /// Config for `port` with every other field at its default.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: None,
            timeout_ms: default_timeout_ms(),
            max_response_bytes: default_max_response_bytes(),
            purge_window_ms: default_purge_window_ms(),
        }
    }

    /// Transport limits derived from this config.
    pub fn settings(&self) -> TransportSettings {
        TransportSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            max_response_bytes: self.max_response_bytes,
            purge_window: Duration::from_millis(self.purge_window_ms),
        }
    }

    /// Configured baud rate or the device default.
    pub fn baud_or(&self, default: u32) -> u32 {
        self.baud_rate.unwrap_or(default)
    }

    /// Semantic checks beyond deserialization.
    pub fn validate(&self) -> AdapterResult<()> {
        if self.port.trim().is_empty() {
            return Err(AdapterError::Configuration("port must not be empty".into()));
        }
        if self.timeout_ms == 0 {
            return Err(AdapterError::Configuration(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        if self.max_response_bytes == 0 {
            return Err(AdapterError::Configuration(
                "max_response_bytes must be greater than zero".into(),
            ));
        }
        if self.baud_rate == Some(0) {
            return Err(AdapterError::Configuration("baud_rate must be non-zero".into()));
        }
        Ok(())
    }
}

/// Deserialize a driver config from its TOML table.
pub fn parse_driver_config<T: serde::de::DeserializeOwned>(config: toml::Value) -> AdapterResult<T> {
    config.try_into().map_err(AdapterError::from)
}

fn default_level() -> String {
    "info".to_string()
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: OutputFormat::default(),
        }
    }
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Name used on the command line.
    pub id: String,
    /// Driver type, matched against the registry.
    #[serde(rename = "type")]
    pub driver_type: String,
    /// Driver-specific table.
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(Default::default())
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptersConfig {
    /// Logging options.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Devices.
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl AdaptersConfig {
    /// Device entry by id.
    pub fn device(&self, id: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn check_unique_ids(&self) -> std::result::Result<(), ConfigLoadError> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigLoadError::DuplicateId(device.id.clone()));
            }
        }
        Ok(())
    }
}

/// Load a configuration file, merged with `ADAPTERS_` environment overrides.
pub fn load_config(path: &Path) -> Result<AdaptersConfig> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
    }

    debug!("Loading adapter config from: {}", path.display());

    let figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("ADAPTERS_").split("__"));

    let config: AdaptersConfig = figment
        .extract()
        .map_err(|e| ConfigLoadError::ParseError(e.to_string()))
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config.check_unique_ids()?;

    info!(
        "Loaded adapter config: {} device(s) from {}",
        config.devices.len(),
        path.display()
    );

    Ok(config)
}
