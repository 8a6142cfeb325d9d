//! Session handshake and capability negotiation
//!
//! Before any data flows the agent sends a handshake request listing the
//! actions it wants the client to perform, the client answers with the
//! outcome of each action, and the agent confirms with a handshake
//! complete. The agent version announced in the request decides which port
//! forwarding variant is usable.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;
use tw_protocol::payload::{
    ActionStatus, HandshakeCompletePayload, HandshakeRequestPayload, HandshakeResponsePayload,
    ProcessedClientAction, SessionTypeRequest, ACTION_KMS_ENCRYPTION, ACTION_SESSION_TYPE,
};

/// Version reported to the agent
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Oldest agent that speaks the stream multiplexer
pub const MUX_MIN_AGENT_VERSION: AgentVersion = AgentVersion::new(3, 0, 196, 0);

/// Oldest agent that honours the `DisconnectToPort` flag
pub const DISCONNECT_TO_PORT_MIN_AGENT_VERSION: AgentVersion = AgentVersion::new(3, 1, 1511, 0);

/// Dotted numeric agent version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AgentVersion {
    parts: [u32; 4],
}

impl AgentVersion {
    /// Create a version from its four components
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            parts: [major, minor, build, revision],
        }
    }
}

impl FromStr for AgentVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 4];
        let mut count = 0;
        for (i, piece) in s.trim().split('.').enumerate() {
            if i >= parts.len() {
                return Err(format!("too many components in version {:?}", s));
            }
            parts[i] = piece
                .parse()
                .map_err(|_| format!("invalid version component {:?} in {:?}", piece, s))?;
            count += 1;
        }
        if count == 0 {
            return Err("empty version".to_string());
        }
        Ok(Self { parts })
    }
}

impl Ord for AgentVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl PartialOrd for AgentVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for AgentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.parts;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Channel not opened yet
    Idle,
    /// Channel open, waiting for the agent's request
    AwaitingRequest,
    /// Request processed, response not yet sent
    RequestReceived,
    /// Response sent, waiting for completion
    ResponseSent,
    /// Agent confirmed the handshake
    Completed,
}

/// What the agent negotiated
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    /// Version announced by the agent
    pub agent_version: AgentVersion,
    /// Session type requested by the agent
    pub session_type: Option<String>,
    /// Session type properties
    pub properties: serde_json::Value,
    /// Whether the handshake completed
    pub handshake_completed: bool,
    /// Request to completion round trip
    pub round_trip: Option<Duration>,
}

impl Capabilities {
    /// Capabilities assumed when the agent never handshakes
    pub fn legacy() -> Self {
        Self {
            agent_version: AgentVersion::default(),
            session_type: None,
            properties: serde_json::Value::Null,
            handshake_completed: false,
            round_trip: None,
        }
    }

    /// Whether the stream multiplexer may be used
    pub fn supports_multiplexing(&self) -> bool {
        self.handshake_completed && self.agent_version >= MUX_MIN_AGENT_VERSION
    }

    /// Whether the agent honours `DisconnectToPort`
    pub fn supports_disconnect_to_port(&self) -> bool {
        self.agent_version >= DISCONNECT_TO_PORT_MIN_AGENT_VERSION
    }
}

/// Client side of the handshake
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    agent_version: AgentVersion,
    session_type: Option<String>,
    properties: serde_json::Value,
    request_received_at: Option<Instant>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    /// Create an idle handshake
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            agent_version: AgentVersion::default(),
            session_type: None,
            properties: serde_json::Value::Null,
            request_received_at: None,
        }
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The channel is open
    pub fn start(&mut self) {
        if self.state == HandshakeState::Idle {
            self.state = HandshakeState::AwaitingRequest;
        }
    }

    /// Process the agent's request and build the response
    pub fn on_request(
        &mut self,
        request: &HandshakeRequestPayload,
        now: Instant,
    ) -> HandshakeResponsePayload {
        self.agent_version = match request.agent_version.parse() {
            Ok(version) => version,
            Err(e) => {
                tracing::warn!("Unparseable agent version: {}", e);
                AgentVersion::default()
            }
        };
        self.request_received_at = Some(now);
        self.state = HandshakeState::RequestReceived;

        tracing::debug!("Handshake request from agent {}", self.agent_version);

        let mut response = HandshakeResponsePayload {
            client_version: CLIENT_VERSION.to_string(),
            processed_client_actions: Vec::with_capacity(request.requested_client_actions.len()),
            errors: Vec::new(),
        };

        for action in &request.requested_client_actions {
            let processed = match action.action_type.as_str() {
                ACTION_SESSION_TYPE => {
                    match serde_json::from_value::<SessionTypeRequest>(
                        action.action_parameters.clone(),
                    ) {
                        Ok(session_type) => {
                            self.session_type = Some(session_type.session_type);
                            self.properties = session_type.properties;
                            outcome(&action.action_type, ActionStatus::Success, String::new())
                        }
                        Err(e) => {
                            let message = format!("invalid SessionType parameters: {}", e);
                            response.errors.push(message.clone());
                            outcome(&action.action_type, ActionStatus::Failed, message)
                        }
                    }
                }
                ACTION_KMS_ENCRYPTION => outcome(
                    &action.action_type,
                    ActionStatus::Unsupported,
                    "payload encryption is not supported by this client".to_string(),
                ),
                other => {
                    tracing::warn!("Unknown handshake action {:?}", other);
                    outcome(
                        &action.action_type,
                        ActionStatus::Unsupported,
                        format!("unknown action {}", other),
                    )
                }
            };
            response.processed_client_actions.push(processed);
        }

        response
    }

    /// The response was handed to the channel
    pub fn on_response_sent(&mut self) {
        if self.state == HandshakeState::RequestReceived {
            self.state = HandshakeState::ResponseSent;
        }
    }

    /// The agent confirmed the handshake
    pub fn on_complete(&mut self, complete: &HandshakeCompletePayload, now: Instant) -> Capabilities {
        self.state = HandshakeState::Completed;
        let round_trip = self
            .request_received_at
            .map(|at| now.saturating_duration_since(at));

        if let Some(rtt) = round_trip {
            tracing::debug!(
                "Handshake completed in {:?} (agent reports {:?})",
                rtt,
                Duration::from_nanos(complete.handshake_time_to_complete.max(0) as u64)
            );
        }
        if !complete.customer_message.is_empty() {
            tracing::info!("{}", complete.customer_message);
        }

        Capabilities {
            agent_version: self.agent_version,
            session_type: self.session_type.clone(),
            properties: self.properties.clone(),
            handshake_completed: true,
            round_trip,
        }
    }
}

fn outcome(action_type: &str, status: ActionStatus, error: String) -> ProcessedClientAction {
    ProcessedClientAction {
        action_type: action_type.to_string(),
        action_status: status,
        action_result: serde_json::Value::Null,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_protocol::payload::RequestedClientAction;

    fn request(version: &str) -> HandshakeRequestPayload {
        HandshakeRequestPayload {
            agent_version: version.to_string(),
            requested_client_actions: vec![
                RequestedClientAction {
                    action_type: ACTION_SESSION_TYPE.to_string(),
                    action_parameters: serde_json::json!({
                        "SessionType": "Port",
                        "Properties": {"portNumber": "80"}
                    }),
                },
                RequestedClientAction {
                    action_type: ACTION_KMS_ENCRYPTION.to_string(),
                    action_parameters: serde_json::json!({"KMSKeyId": "key"}),
                },
            ],
        }
    }

    #[test]
    fn test_agent_version_ordering() {
        let old: AgentVersion = "2.2.0.0".parse().unwrap();
        let mux: AgentVersion = "3.0.196.0".parse().unwrap();
        let new: AgentVersion = "3.1.1511.0".parse().unwrap();

        assert!(old < mux);
        assert!(mux < new);
        assert_eq!(mux, MUX_MIN_AGENT_VERSION);
        assert_eq!("3.1".parse::<AgentVersion>().unwrap(), AgentVersion::new(3, 1, 0, 0));
        assert_eq!(new.to_string(), "3.1.1511.0");

        assert!("3.x.1".parse::<AgentVersion>().is_err());
        assert!("1.2.3.4.5".parse::<AgentVersion>().is_err());
    }

    #[test]
    fn test_handshake_flow() {
        let now = Instant::now();
        let mut handshake = Handshake::new();
        assert_eq!(handshake.state(), HandshakeState::Idle);

        handshake.start();
        assert_eq!(handshake.state(), HandshakeState::AwaitingRequest);

        let response = handshake.on_request(&request("3.1.1511.0"), now);
        assert_eq!(handshake.state(), HandshakeState::RequestReceived);
        assert_eq!(response.client_version, CLIENT_VERSION);
        assert_eq!(response.processed_client_actions.len(), 2);
        assert_eq!(
            response.processed_client_actions[0].action_status,
            ActionStatus::Success
        );
        assert_eq!(
            response.processed_client_actions[1].action_status,
            ActionStatus::Unsupported
        );

        handshake.on_response_sent();
        assert_eq!(handshake.state(), HandshakeState::ResponseSent);

        let capabilities = handshake.on_complete(
            &HandshakeCompletePayload::default(),
            now + Duration::from_millis(40),
        );
        assert_eq!(handshake.state(), HandshakeState::Completed);
        assert_eq!(capabilities.session_type.as_deref(), Some("Port"));
        assert_eq!(capabilities.round_trip, Some(Duration::from_millis(40)));
        assert!(capabilities.supports_multiplexing());
        assert!(capabilities.supports_disconnect_to_port());
    }

    #[test]
    fn test_old_agent_capabilities() {
        let now = Instant::now();
        let mut handshake = Handshake::new();
        handshake.start();
        handshake.on_request(&request("3.0.100.0"), now);
        let capabilities = handshake.on_complete(&HandshakeCompletePayload::default(), now);

        assert!(!capabilities.supports_multiplexing());
        assert!(!capabilities.supports_disconnect_to_port());
        assert!(!Capabilities::legacy().supports_multiplexing());
    }

    #[test]
    fn test_bad_session_type_parameters() {
        let mut handshake = Handshake::new();
        let request = HandshakeRequestPayload {
            agent_version: "3.1.0.0".to_string(),
            requested_client_actions: vec![RequestedClientAction {
                action_type: ACTION_SESSION_TYPE.to_string(),
                action_parameters: serde_json::json!("not an object"),
            }],
        };
        let response = handshake.on_request(&request, Instant::now());
        assert_eq!(
            response.processed_client_actions[0].action_status,
            ActionStatus::Failed
        );
        assert_eq!(response.errors.len(), 1);
    }
}
