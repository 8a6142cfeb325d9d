//! Configuration management for tunnelwire

mod channel;
mod mux;
pub mod serde_utils;

pub use channel::ChannelConfig;
pub use mux::MuxConfig;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnelwire")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Contents of a configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Channel engine settings
    pub channel: ChannelConfig,
    /// Multiplexer settings
    pub mux: MuxConfig,
}

impl ConfigFile {
    /// Check every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel.validate()?;
        self.mux.validate()
    }

    /// Load from `path`, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = match load_config::<Self>(path) {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}
