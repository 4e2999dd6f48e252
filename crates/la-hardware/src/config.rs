//! Hardware configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (optional; a missing file means defaults)
//! 3. Environment variables prefixed with `LA_`, `__` separating sections
//!
//! # Example
//! ```toml
//! [detection]
//! serial = true
//! network_targets = ["192.168.4.1:4045"]
//! scpi_targets = ["10.0.0.20"]
//! saleae_endpoint = "127.0.0.1:10430"
//! sigrok = true
//! cache_ttl_secs = 30
//!
//! [sigrok]
//! binary = "/usr/local/bin/sigrok-cli"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```
//!
//! `LA_DETECTION__CACHE_TTL_SECS=5` overrides the cache TTL.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use la_drivers::address::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "LA_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level hardware configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub detection: DetectionConfig,
    pub sigrok: SigrokConfig,
    pub logging: LoggingConfig,
}

/// What `detect_hardware` looks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Enumerate serial ports.
    pub serial: bool,
    /// `host:port` of binary-protocol network analyzers to probe.
    pub network_targets: Vec<String>,
    /// `host[:port]` of SCPI instruments to identify.
    pub scpi_targets: Vec<String>,
    /// Vendor JSON-API endpoint to query, if any.
    pub saleae_endpoint: Option<String>,
    /// Ask `sigrok-cli --scan` for devices.
    pub sigrok: bool,
    /// List a software analyzer among detected devices.
    pub emulated: bool,
    pub cache_ttl_secs: u64,
    pub probe_timeout_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            serial: true,
            network_targets: Vec::new(),
            scpi_targets: Vec::new(),
            saleae_endpoint: None,
            sigrok: false,
            emulated: false,
            cache_ttl_secs: 30,
            probe_timeout_ms: 1000,
        }
    }
}

impl DetectionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigrokConfig {
    /// `sigrok-cli` executable, looked up on `PATH` when not absolute.
    pub binary: PathBuf,
}

impl Default for SigrokConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(la_drivers::sigrok::DEFAULT_BINARY),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl HardwareConfig {
    /// Load from `path` (if given) and the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(HardwareConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: HardwareConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.logging.level.to_ascii_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log level '{}' must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }
        let format = self.logging.format.to_ascii_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log format '{}' must be one of: {}",
                self.logging.format,
                VALID_FORMATS.join(", ")
            )));
        }
        for target in &self.detection.network_targets {
            Endpoint::parse(target, None)
                .map_err(|e| ConfigError::Invalid(format!("network target: {}", e)))?;
        }
        for target in &self.detection.scpi_targets {
            Endpoint::parse(target, Some(la_drivers::scpi::DEFAULT_PORT))
                .map_err(|e| ConfigError::Invalid(format!("scpi target: {}", e)))?;
        }
        if let Some(endpoint) = &self.detection.saleae_endpoint {
            Endpoint::parse(endpoint, Some(la_drivers::saleae::DEFAULT_PORT))
                .map_err(|e| ConfigError::Invalid(format!("saleae endpoint: {}", e)))?;
        }
        if self.sigrok.binary.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("sigrok binary path is empty".into()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
