//! Channel engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::error::ConfigError;

/// Reliability settings for one session channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Tick of the resend scheduler
    #[serde(with = "duration_millis")]
    pub resend_interval: Duration,

    /// Retransmission timeout before any round trip was measured
    #[serde(with = "duration_millis")]
    pub initial_retransmission_timeout: Duration,

    /// Upper bound of the retransmission timeout
    #[serde(with = "duration_millis")]
    pub max_retransmission_timeout: Duration,

    /// Transmissions of one envelope before the session is given up
    pub max_resend_attempts: u32,

    /// Out-of-order envelopes held while waiting for a gap to fill
    pub incoming_buffer_capacity: usize,

    /// Unacknowledged envelopes held for retransmission
    pub outgoing_buffer_capacity: usize,

    /// How long to wait for the agent's handshake request
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,

    /// Largest chunk read from a local connection per envelope
    pub stream_chunk_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(100),
            initial_retransmission_timeout: Duration::from_millis(100),
            max_retransmission_timeout: Duration::from_secs(1),
            // About five minutes at the default tick
            max_resend_attempts: 3000,
            incoming_buffer_capacity: 10_000,
            outgoing_buffer_capacity: 10_000,
            handshake_timeout: Duration::from_secs(15),
            stream_chunk_size: 1024,
        }
    }
}

impl ChannelConfig {
    /// Check that every setting is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resend_interval.is_zero() {
            return Err(ConfigError::Invalid("resend_interval must be non-zero".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid("handshake_timeout must be non-zero".into()));
        }
        if self.resend_interval > self.max_retransmission_timeout {
            return Err(ConfigError::Invalid(format!(
                "resend_interval ({:?}) exceeds max_retransmission_timeout ({:?})",
                self.resend_interval, self.max_retransmission_timeout
            )));
        }
        if self.max_resend_attempts == 0 {
            return Err(ConfigError::Invalid("max_resend_attempts must be non-zero".into()));
        }
        if self.incoming_buffer_capacity == 0 || self.outgoing_buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer capacities must be non-zero".into()));
        }
        if self.stream_chunk_size == 0 {
            return Err(ConfigError::Invalid("stream_chunk_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ChannelConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = ChannelConfig {
            resend_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_interval_above_max_rto_rejected() {
        let config = ChannelConfig {
            resend_interval: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ChannelConfig = toml::from_str("resend_interval = 50").unwrap();
        assert_eq!(config.resend_interval, Duration::from_millis(50));
        assert_eq!(config.incoming_buffer_capacity, 10_000);
    }
}
