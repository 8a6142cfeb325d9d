//! Forward specification parsing
//!
//! A forward is written `localPort:[remoteHost:]remotePort`, the same
//! shape as ssh's `-L`. Local port 0 lets the OS choose.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tw_core::PortParameters;

/// Host assumed when the forward names none
pub const DEFAULT_REMOTE_HOST: &str = "localhost";

/// Errors from parsing a forward specification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardSpecError {
    #[error("invalid port forward specification: {0} (expected localPort:[remoteHost:]remotePort)")]
    Malformed(String),

    #[error("invalid local port: {0}")]
    InvalidLocalPort(String),

    #[error("local port out of range (0-65535): {0}")]
    LocalPortOutOfRange(String),

    #[error("invalid remote port: {0}")]
    InvalidRemotePort(String),

    #[error("remote port out of range (1-65535): {0}")]
    RemotePortOutOfRange(String),
}

/// A parsed `-L` specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    /// Whether the destination is the target itself
    pub fn is_local_target(&self) -> bool {
        self.remote_host == "localhost" || self.remote_host == "127.0.0.1"
    }

    /// Session parameters for this forward
    pub fn to_parameters(&self) -> PortParameters {
        PortParameters::tcp(self.local_port, self.remote_port).with_host(self.remote_host.clone())
    }

    /// Forwarding description with the port actually bound
    ///
    /// `port:remotePort` for the target itself, `port:host:remotePort`
    /// otherwise.
    pub fn forwarding(&self, bound_port: u16) -> String {
        if self.is_local_target() {
            format!("{}:{}", bound_port, self.remote_port)
        } else {
            format!("{}:{}:{}", bound_port, self.remote_host, self.remote_port)
        }
    }
}

impl FromStr for ForwardSpec {
    type Err = ForwardSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (local, host, remote) = match parts.as_slice() {
            [local, remote] => (*local, DEFAULT_REMOTE_HOST, *remote),
            [local, host, remote] => (*local, *host, *remote),
            _ => return Err(ForwardSpecError::Malformed(s.to_string())),
        };

        let local_port = parse_port(local)
            .ok_or_else(|| ForwardSpecError::InvalidLocalPort(local.to_string()))?;
        let local_port = u16::try_from(local_port)
            .map_err(|_| ForwardSpecError::LocalPortOutOfRange(local.to_string()))?;

        let remote_port = parse_port(remote)
            .ok_or_else(|| ForwardSpecError::InvalidRemotePort(remote.to_string()))?;
        let remote_port = u16::try_from(remote_port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ForwardSpecError::RemotePortOutOfRange(remote.to_string()))?;

        Ok(Self {
            local_port,
            remote_host: host.to_string(),
            remote_port,
        })
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

/// Parse a decimal port, allowing out-of-range values through for the
/// range check
fn parse_port(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_core::types::{DOCUMENT_PORT_FORWARDING, DOCUMENT_PORT_FORWARDING_TO_REMOTE_HOST};

    #[test]
    fn test_two_part_spec_targets_localhost() {
        let spec: ForwardSpec = "8080:80".parse().unwrap();
        assert_eq!(spec.local_port, 8080);
        assert_eq!(spec.remote_host, "localhost");
        assert_eq!(spec.remote_port, 80);
        assert!(spec.is_local_target());

        let params = spec.to_parameters();
        assert_eq!(params.host, None);
        assert_eq!(params.document_name(), DOCUMENT_PORT_FORWARDING);
    }

    #[test]
    fn test_three_part_spec_targets_remote_host() {
        let spec: ForwardSpec = "0:db.internal:5432".parse().unwrap();
        assert_eq!(spec.local_port, 0);
        assert_eq!(spec.remote_host, "db.internal");

        let params = spec.to_parameters();
        assert_eq!(params.host.as_deref(), Some("db.internal"));
        assert_eq!(params.document_name(), DOCUMENT_PORT_FORWARDING_TO_REMOTE_HOST);
        assert_eq!(spec.forwarding(40123), "40123:db.internal:5432");
    }

    #[test]
    fn test_forwarding_for_local_target() {
        let spec: ForwardSpec = "0:127.0.0.1:22".parse().unwrap();
        assert_eq!(spec.forwarding(50000), "50000:22");
    }

    #[test]
    fn test_rejects_bad_specs() {
        assert_eq!(
            "8080".parse::<ForwardSpec>(),
            Err(ForwardSpecError::Malformed("8080".into()))
        );
        assert!(matches!(
            "1:2:3:4".parse::<ForwardSpec>(),
            Err(ForwardSpecError::Malformed(_))
        ));
        assert_eq!(
            "abc:80".parse::<ForwardSpec>(),
            Err(ForwardSpecError::InvalidLocalPort("abc".into()))
        );
        assert_eq!(
            "70000:80".parse::<ForwardSpec>(),
            Err(ForwardSpecError::LocalPortOutOfRange("70000".into()))
        );
        assert_eq!(
            "-1:80".parse::<ForwardSpec>(),
            Err(ForwardSpecError::LocalPortOutOfRange("-1".into()))
        );
        assert_eq!(
            "8080:http".parse::<ForwardSpec>(),
            Err(ForwardSpecError::InvalidRemotePort("http".into()))
        );
        assert_eq!(
            "8080:0".parse::<ForwardSpec>(),
            Err(ForwardSpecError::RemotePortOutOfRange("0".into()))
        );
        assert_eq!(
            "8080:host:65536".parse::<ForwardSpec>(),
            Err(ForwardSpecError::RemotePortOutOfRange("65536".into()))
        );
    }

    #[test]
    fn test_error_message() {
        let err = "nope".parse::<ForwardSpec>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid port forward specification: nope (expected localPort:[remoteHost:]remotePort)"
        );
    }
}
