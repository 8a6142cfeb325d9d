//! Envelope type tags
//!
//! The remote agent identifies envelopes by an ASCII message type name in a
//! fixed 32-byte field, and sub-kinds of stream data by a numeric payload
//! type. Handshake traffic is stream data with a handshake payload type, so
//! it is sequenced and acknowledged like every other chunk.
//!
//! # Message Flow
//!
//! 1. Agent sends `output_stream_data` / `HandshakeRequest`
//! 2. Client answers `input_stream_data` / `HandshakeResponse`
//! 3. Agent sends `output_stream_data` / `HandshakeComplete`
//! 4. Stream data flows in both directions; every stream envelope is
//!    answered with an `acknowledge`
//! 5. Agent sends `channel_closed` when the session ends

use std::fmt;

/// Envelope message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client to agent stream data
    InputStreamData,
    /// Agent to client stream data
    OutputStreamData,
    /// Acknowledgement of a stream data envelope
    Acknowledge,
    /// The remote side closed the channel
    ChannelClosed,
    /// Agent asks the client to resume sending
    StartPublication,
    /// Agent asks the client to hold stream data
    PausePublication,
}

impl MessageType {
    /// Wire name of this message type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::InputStreamData => "input_stream_data",
            MessageType::OutputStreamData => "output_stream_data",
            MessageType::Acknowledge => "acknowledge",
            MessageType::ChannelClosed => "channel_closed",
            MessageType::StartPublication => "start_publication",
            MessageType::PausePublication => "pause_publication",
        }
    }

    /// Parse a wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "input_stream_data" => Some(Self::InputStreamData),
            "output_stream_data" => Some(Self::OutputStreamData),
            "acknowledge" => Some(Self::Acknowledge),
            "channel_closed" => Some(Self::ChannelClosed),
            "start_publication" => Some(Self::StartPublication),
            "pause_publication" => Some(Self::PausePublication),
            _ => None,
        }
    }

    /// Whether envelopes of this type carry sequenced stream data
    pub fn is_stream_data(&self) -> bool {
        matches!(
            self,
            MessageType::InputStreamData | MessageType::OutputStreamData
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload sub-kind of a stream data envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PayloadType {
    /// No payload type set
    Undefined = 0,
    /// Regular output bytes
    Output = 1,
    /// Error text
    Error = 2,
    /// Terminal size update
    Size = 3,
    /// Session parameters
    Parameter = 4,
    /// Handshake request from the agent
    HandshakeRequest = 5,
    /// Handshake response from the client
    HandshakeResponse = 6,
    /// Handshake completion from the agent
    HandshakeComplete = 7,
    /// Encryption challenge request
    EncChallengeRequest = 8,
    /// Encryption challenge response
    EncChallengeResponse = 9,
    /// Port session control flag
    Flag = 10,
    /// Standard error bytes
    StdErr = 11,
    /// Remote process exit code
    ExitCode = 12,
}

impl PayloadType {
    /// Convert to u32
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::Output),
            2 => Some(Self::Error),
            3 => Some(Self::Size),
            4 => Some(Self::Parameter),
            5 => Some(Self::HandshakeRequest),
            6 => Some(Self::HandshakeResponse),
            7 => Some(Self::HandshakeComplete),
            8 => Some(Self::EncChallengeRequest),
            9 => Some(Self::EncChallengeResponse),
            10 => Some(Self::Flag),
            11 => Some(Self::StdErr),
            12 => Some(Self::ExitCode),
            _ => None,
        }
    }
}

/// Envelope flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(pub u64);

impl Flags {
    /// Plain data
    pub const DATA: Flags = Flags(0);
    /// First stream envelope in a direction
    pub const SYN: Flags = Flags(1);
    /// End of stream
    pub const FIN: Flags = Flags(2);
    /// Value carried by acknowledgements
    pub const ACK: Flags = Flags(3);

    /// Raw bits
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the end-of-stream bit is set
    pub fn is_end_of_stream(&self) -> bool {
        self.contains(Flags::FIN)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}
