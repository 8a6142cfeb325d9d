//! Typed payloads carried inside envelopes
//!
//! Structured payloads are JSON documents with PascalCase field names, the
//! form the remote agent produces and expects. Port control flags are a
//! bare big-endian `u32`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::message::{Flags, MessageType, PayloadType};

/// Serialize a JSON payload
pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Deserialize a JSON payload
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Body of an `acknowledge` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AcknowledgeContent {
    pub acknowledged_message_type: String,
    pub acknowledged_message_id: String,
    pub acknowledged_message_sequence_number: i64,
    pub is_sequential_message: bool,
}

impl AcknowledgeContent {
    /// Acknowledgement for a received stream data envelope
    pub fn for_envelope(envelope: &Envelope) -> Self {
        Self {
            acknowledged_message_type: envelope.message_type.as_str().to_string(),
            acknowledged_message_id: envelope.message_id.to_string(),
            acknowledged_message_sequence_number: envelope.sequence_number,
            is_sequential_message: true,
        }
    }

    /// Parse the body of an `acknowledge` envelope
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        decode_json(&envelope.payload)
    }

    /// Wrap into an `acknowledge` envelope
    ///
    /// Acknowledgements are not sequenced; they always carry sequence 0.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let payload = encode_json(self)?;
        Ok(
            Envelope::new(MessageType::Acknowledge, 0, PayloadType::Undefined, payload)
                .with_flags(Flags::ACK),
        )
    }
}

/// Body of a `channel_closed` envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChannelClosed {
    pub message_id: String,
    pub created_date: String,
    pub destination_id: String,
    pub session_id: String,
    pub message_type: String,
    pub schema_version: u32,
    pub output: String,
}

/// Requested action of type `SessionType`
pub const ACTION_SESSION_TYPE: &str = "SessionType";

/// Requested action of type `KMSEncryption`
pub const ACTION_KMS_ENCRYPTION: &str = "KMSEncryption";

/// One action the agent asks the client to perform during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestedClientAction {
    pub action_type: String,
    #[serde(default)]
    pub action_parameters: serde_json::Value,
}

/// Handshake request sent by the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HandshakeRequestPayload {
    pub agent_version: String,
    pub requested_client_actions: Vec<RequestedClientAction>,
}

/// Parameters of a `SessionType` action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionTypeRequest {
    pub session_type: String,
    pub properties: serde_json::Value,
}

/// Outcome of a processed client action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ActionStatus {
    Success = 1,
    Failed = 2,
    Unsupported = 3,
}

impl From<ActionStatus> for u32 {
    fn from(status: ActionStatus) -> u32 {
        status as u32
    }
}

impl TryFrom<u32> for ActionStatus {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Success),
            2 => Ok(Self::Failed),
            3 => Ok(Self::Unsupported),
            other => Err(format!("unknown action status {}", other)),
        }
    }
}

/// Client answer to one requested action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessedClientAction {
    pub action_type: String,
    pub action_status: ActionStatus,
    #[serde(default)]
    pub action_result: serde_json::Value,
    #[serde(default)]
    pub error: String,
}

/// Handshake response sent by the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HandshakeResponsePayload {
    pub client_version: String,
    pub processed_client_actions: Vec<ProcessedClientAction>,
    pub errors: Vec<String>,
}

/// Handshake completion sent by the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HandshakeCompletePayload {
    /// Agent-side handshake duration in nanoseconds
    pub handshake_time_to_complete: i64,
    pub customer_message: String,
}

/// Port session control flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PortFlag {
    /// The local tenant went away; the agent should drop its connection
    DisconnectToPort = 1,
    /// The client is done with the session
    TerminateSession = 2,
    /// The agent could not reach the remote port
    ConnectToPortError = 3,
}

impl PortFlag {
    /// Encode as a 4-byte big-endian payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(*self as u32);
        buf.freeze()
    }

    /// Decode a flag payload
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 4 {
            return None;
        }
        let mut buf = payload;
        match buf.get_u32() {
            1 => Some(Self::DisconnectToPort),
            2 => Some(Self::TerminateSession),
            3 => Some(Self::ConnectToPortError),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_field_names() {
        let envelope = Envelope::new(
            MessageType::OutputStreamData,
            42,
            PayloadType::Output,
            Bytes::from_static(b"data"),
        );
        let ack = AcknowledgeContent::for_envelope(&envelope);
        let json = serde_json::to_value(&ack).unwrap();

        assert_eq!(json["AcknowledgedMessageType"], "output_stream_data");
        assert_eq!(json["AcknowledgedMessageSequenceNumber"], 42);
        assert_eq!(json["IsSequentialMessage"], true);
        assert_eq!(
            json["AcknowledgedMessageId"],
            envelope.message_id.to_string()
        );
    }

    #[test]
    fn test_acknowledge_envelope() {
        let envelope = Envelope::new(
            MessageType::OutputStreamData,
            3,
            PayloadType::Output,
            Bytes::from_static(b"x"),
        );
        let ack = AcknowledgeContent::for_envelope(&envelope)
            .to_envelope()
            .unwrap();

        assert_eq!(ack.message_type, MessageType::Acknowledge);
        assert_eq!(ack.flags, Flags::ACK);
        assert_eq!(ack.sequence_number, 0);

        let parsed = AcknowledgeContent::from_envelope(&ack).unwrap();
        assert_eq!(parsed.acknowledged_message_sequence_number, 3);
    }

    #[test]
    fn test_handshake_request_from_agent() {
        let json = r#"{
            "AgentVersion": "3.1.1511.0",
            "RequestedClientActions": [
                {
                    "ActionType": "SessionType",
                    "ActionParameters": {
                        "SessionType": "Port",
                        "Properties": {"portNumber": "22"}
                    }
                }
            ]
        }"#;
        let request: HandshakeRequestPayload = decode_json(json.as_bytes()).unwrap();
        assert_eq!(request.agent_version, "3.1.1511.0");
        assert_eq!(request.requested_client_actions.len(), 1);

        let action = &request.requested_client_actions[0];
        assert_eq!(action.action_type, ACTION_SESSION_TYPE);
        let session_type: SessionTypeRequest =
            serde_json::from_value(action.action_parameters.clone()).unwrap();
        assert_eq!(session_type.session_type, "Port");
        assert_eq!(session_type.properties["portNumber"], "22");
    }

    #[test]
    fn test_action_status_is_numeric() {
        let action = ProcessedClientAction {
            action_type: ACTION_KMS_ENCRYPTION.to_string(),
            action_status: ActionStatus::Unsupported,
            action_result: serde_json::Value::Null,
            error: "encryption is not supported".to_string(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["ActionStatus"], 3);

        let parsed: ProcessedClientAction = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.action_status, ActionStatus::Unsupported);
    }

    #[test]
    fn test_channel_closed_tolerates_missing_fields() {
        let closed: ChannelClosed =
            decode_json(br#"{"SessionId":"s-1","Output":"bye"}"#).unwrap();
        assert_eq!(closed.session_id, "s-1");
        assert_eq!(closed.output, "bye");
        assert_eq!(closed.schema_version, 0);
    }

    #[test]
    fn test_port_flag() {
        assert_eq!(PortFlag::TerminateSession.encode().as_ref(), &[0, 0, 0, 2]);
        assert_eq!(
            PortFlag::decode(&[0, 0, 0, 3]),
            Some(PortFlag::ConnectToPortError)
        );
        assert_eq!(PortFlag::decode(&[0, 0, 0, 9]), None);
        assert_eq!(PortFlag::decode(&[1]), None);
    }
}
