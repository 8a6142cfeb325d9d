//! Core domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::SessionError;

/// Session document for forwarding to a port on the target itself
pub const DOCUMENT_PORT_FORWARDING: &str = "AWS-StartPortForwardingSession";

/// Session document for forwarding through the target to another host
pub const DOCUMENT_PORT_FORWARDING_TO_REMOTE_HOST: &str =
    "AWS-StartPortForwardingSessionToRemoteHost";

/// What a session forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForwardingType {
    /// Local connections are forwarded to a remote port
    #[default]
    LocalPortForwarding,
    /// Standard input/output is streamed to the remote side
    Stream,
}

/// Kind of local listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalConnectionType {
    /// TCP on the loopback interface
    #[default]
    Tcp,
    /// Unix-domain socket
    Unix,
}

impl fmt::Display for LocalConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalConnectionType::Tcp => write!(f, "tcp"),
            LocalConnectionType::Unix => write!(f, "unix"),
        }
    }
}

/// Port forwarding parameters, fixed for the life of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortParameters {
    /// Remote port the agent connects to
    pub port_number: u16,
    /// Remote host reached from the target, `None` for the target itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Forwarding kind
    #[serde(default)]
    pub forwarding_type: ForwardingType,
    /// Local port, 0 lets the OS choose
    #[serde(default)]
    pub local_port_number: u16,
    /// Local listener kind
    #[serde(default)]
    pub local_connection_type: LocalConnectionType,
    /// Socket path for Unix-domain listeners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_unix_socket: Option<PathBuf>,
}

impl PortParameters {
    /// TCP forwarding from a local port to a port on the target
    pub fn tcp(local_port_number: u16, port_number: u16) -> Self {
        Self {
            port_number,
            host: None,
            forwarding_type: ForwardingType::LocalPortForwarding,
            local_port_number,
            local_connection_type: LocalConnectionType::Tcp,
            local_unix_socket: None,
        }
    }

    /// Forward to another host reachable from the target
    ///
    /// `localhost` and `127.0.0.1` mean the target itself.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.host = if is_loopback_name(&host) { None } else { Some(host) };
        self
    }

    /// Listen on a Unix-domain socket instead of TCP
    pub fn with_unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_connection_type = LocalConnectionType::Unix;
        self.local_unix_socket = Some(path.into());
        self
    }

    /// Check the parameters before a session starts
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.forwarding_type == ForwardingType::LocalPortForwarding && self.port_number == 0 {
            return Err(SessionError::InvalidParameters(
                "remote port out of range (1-65535): 0".into(),
            ));
        }
        if self.local_connection_type == LocalConnectionType::Unix
            && self.local_unix_socket.is_none()
        {
            return Err(SessionError::InvalidParameters(
                "unix listener requires a socket path".into(),
            ));
        }
        Ok(())
    }

    /// Session document matching the destination
    pub fn document_name(&self) -> &'static str {
        match self.host {
            Some(_) => DOCUMENT_PORT_FORWARDING_TO_REMOTE_HOST,
            None => DOCUMENT_PORT_FORWARDING,
        }
    }

    /// Parameters passed to the session document
    pub fn document_parameters(&self) -> BTreeMap<String, Vec<String>> {
        let mut params = BTreeMap::new();
        params.insert("portNumber".to_string(), vec![self.port_number.to_string()]);
        params.insert(
            "localPortNumber".to_string(),
            vec![self.local_port_number.to_string()],
        );
        if let Some(host) = &self.host {
            params.insert("host".to_string(), vec![host.clone()]);
        }
        params
    }

    /// Human readable description of the forward
    pub fn describe(&self) -> String {
        match &self.host {
            Some(host) => format!(
                "local {} -> target -> {}:{}",
                self.local_port_number, host, self.port_number
            ),
            None => format!("local {} -> target {}", self.local_port_number, self.port_number),
        }
    }
}

fn is_loopback_name(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1"
}

/// Where a port session accepts local connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEndpoint {
    /// Bound TCP address
    Tcp(SocketAddr),
    /// Bound socket path
    Unix(PathBuf),
}

impl LocalEndpoint {
    /// TCP port, if this is a TCP endpoint
    pub fn port(&self) -> Option<u16> {
        match self {
            LocalEndpoint::Tcp(addr) => Some(addr.port()),
            LocalEndpoint::Unix(_) => None,
        }
    }
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalEndpoint::Tcp(addr) => write!(f, "{}", addr),
            LocalEndpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Opaque session handle returned by session negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub token_value: String,
    pub stream_url: String,
}

impl SessionInfo {
    /// Parse the JSON document printed by a session negotiation tool
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let info: SessionInfo = serde_json::from_str(json)
            .map_err(|e| SessionError::InvalidSessionInfo(e.to_string()))?;
        info.validate()?;
        Ok(info)
    }

    /// Check that no field is empty
    pub fn validate(&self) -> Result<(), SessionError> {
        for (name, value) in [
            ("SessionId", &self.session_id),
            ("TokenValue", &self.token_value),
            ("StreamUrl", &self.stream_url),
        ] {
            if value.trim().is_empty() {
                return Err(SessionError::InvalidSessionInfo(format!(
                    "missing required field {}",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Request to start a session on a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartSessionRequest {
    pub target: String,
    pub document_name: String,
    pub parameters: BTreeMap<String, Vec<String>>,
}

impl StartSessionRequest {
    /// Request for a port forwarding session
    pub fn port_forwarding(target: impl Into<String>, params: &PortParameters) -> Self {
        Self {
            target: target.into(),
            document_name: params.document_name().to_string(),
            parameters: params.document_parameters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_auto_selection() {
        let local = PortParameters::tcp(8080, 80).with_host("localhost");
        assert_eq!(local.host, None);
        assert_eq!(local.document_name(), DOCUMENT_PORT_FORWARDING);

        let remote = PortParameters::tcp(3306, 3306).with_host("db.internal");
        assert_eq!(remote.document_name(), DOCUMENT_PORT_FORWARDING_TO_REMOTE_HOST);
        assert_eq!(remote.document_parameters()["host"], vec!["db.internal"]);
    }

    #[test]
    fn test_document_parameters() {
        let params = PortParameters::tcp(0, 22).document_parameters();
        assert_eq!(params["portNumber"], vec!["22"]);
        assert_eq!(params["localPortNumber"], vec!["0"]);
        assert!(!params.contains_key("host"));
    }

    #[test]
    fn test_validate() {
        assert!(PortParameters::tcp(0, 22).validate().is_ok());
        assert!(PortParameters::tcp(0, 0).validate().is_err());

        let mut unix = PortParameters::tcp(0, 22);
        unix.local_connection_type = LocalConnectionType::Unix;
        assert!(unix.validate().is_err());
        assert!(unix.with_unix_socket("/tmp/tw.sock").validate().is_ok());
    }

    #[test]
    fn test_session_info_from_json() {
        let info = SessionInfo::from_json(
            r#"{"SessionId":"s-1","TokenValue":"tok","StreamUrl":"wss://example/s-1"}"#,
        )
        .unwrap();
        assert_eq!(info.session_id, "s-1");

        let missing = SessionInfo::from_json(
            r#"{"SessionId":"s-1","TokenValue":"","StreamUrl":"wss://example/s-1"}"#,
        );
        assert!(matches!(missing, Err(SessionError::InvalidSessionInfo(_))));
        assert!(SessionInfo::from_json("not json").is_err());
    }

    #[test]
    fn test_local_endpoint_display() {
        let tcp = LocalEndpoint::Tcp("127.0.0.1:4000".parse().unwrap());
        assert_eq!(tcp.to_string(), "127.0.0.1:4000");
        assert_eq!(tcp.port(), Some(4000));
        assert_eq!(LocalEndpoint::Unix("/tmp/a.sock".into()).port(), None);
    }
}
