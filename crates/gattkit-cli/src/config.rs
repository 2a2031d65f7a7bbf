//! gattkit CLI configuration
//!
//! Loaded from a TOML file with `[session]`, `[scan]` and `[logging]`
//! tables. Every key is optional and falls back to its default. Without an
//! explicit `--config` the file at [`AppConfig::default_config_path`] is used
//! when it exists.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use gattkit_core::{uuids, ScanSettings, SessionConfiguration};

use crate::error::{CliError, Result};

/// Upper bound for scan durations and the resolve timeout
const MAX_SCAN_SECS: u64 = 24 * 60 * 60;

// ----------------------------------------------------------------------------
// Configuration Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Timeouts and discovery filters for every session the CLI opens
    pub session: SessionConfiguration,
    pub scan: ScanConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    #[serde(flatten)]
    pub settings: ScanSettings,
    /// How long `scan` listens for advertisements
    pub duration_secs: u64,
    /// How long other commands scan for their target device
    pub resolve_timeout_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            settings: ScanSettings::default(),
            duration_secs: 10,
            resolve_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when neither `--verbose` nor `RUST_LOG` is given
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Loading
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load `path`, or the default file when present, or the defaults
    pub fn load(path: Option<&str>) -> Result<Self> {
        if let Some(path) = path {
            info!("Loading configuration from: {}", path);
            return Self::load_from_file(path);
        }

        match Self::default_config_path() {
            Some(path) if path.exists() => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            _ => {
                info!("Using default configuration");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/gattkit/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gattkit").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan.duration_secs == 0 {
            return Err(CliError::Config("scan duration must be greater than 0".to_string()));
        }
        if self.scan.resolve_timeout_secs == 0 {
            return Err(CliError::Config("resolve timeout must be greater than 0".to_string()));
        }
        if self.scan.duration_secs > MAX_SCAN_SECS || self.scan.resolve_timeout_secs > MAX_SCAN_SECS {
            return Err(CliError::Config(format!(
                "scan durations are limited to {} seconds",
                MAX_SCAN_SECS
            )));
        }
        if self.logging.level.trim().is_empty() {
            return Err(CliError::Config("logging level must not be empty".to_string()));
        }
        Ok(())
    }

    /// Example configuration file content
    pub fn example_config() -> Result<String> {
        let example = AppConfig {
            session: SessionConfiguration::default()
                .with_services(vec![uuids::services::DEVICE_INFORMATION, uuids::services::BATTERY]),
            ..Default::default()
        };
        Ok(toml::to_string_pretty(&example)?)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
