//! Stream multiplexer configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::error::ConfigError;

/// Settings for the multiplexed forwarding variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Interval between keepalive frames
    #[serde(with = "duration_millis")]
    pub keepalive_interval: Duration,

    /// Largest data section written in one frame
    pub max_frame_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            max_frame_size: 32768,
        }
    }
}

impl MuxConfig {
    /// Check that every setting is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid("keepalive_interval must be non-zero".into()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be between 1 and {}",
                u16::MAX
            )));
        }
        Ok(())
    }
}
