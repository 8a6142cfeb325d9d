//! Core error types for tunnelwire

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tw_protocol::ProtocolError;

/// Top-level error type for a tunnel session
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The remote side ran too far ahead of the next expected sequence number
    #[error("Sequence gap overflow: more than {capacity} out-of-order envelopes buffered")]
    SequenceGapOverflow { capacity: usize },

    /// Too many sent envelopes are waiting for an acknowledgement
    #[error("Outgoing buffer overflow: more than {capacity} unacknowledged envelopes")]
    OutgoingBufferOverflow { capacity: usize },

    /// An envelope was never acknowledged
    #[error("Envelope {sequence_number} unacknowledged after {attempts} transmissions")]
    ResendTimeout { sequence_number: i64, attempts: u32 },

    /// Local connection I/O error
    #[error("Local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// No handshake request arrived in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The channel is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TunnelError {
    /// Whether this error ends the whole session
    ///
    /// Local I/O errors are scoped to one connection, a handshake timeout
    /// only selects the legacy forwarding variant, and a malformed envelope
    /// is recovered by the sender's retransmission.
    pub fn is_fatal(&self) -> bool {
        match self {
            TunnelError::LocalIo(_) | TunnelError::HandshakeTimeout(_) => false,
            TunnelError::Protocol(_) => false,
            TunnelError::Transport(e) => e.is_permanent(),
            _ => true,
        }
    }
}

/// Transport-related errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not open the transport
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Sending a frame failed
    #[error("Send failed: {0}")]
    Send(String),

    /// Receiving a frame failed
    #[error("Receive failed: {0}")]
    Receive(String),

    /// The transport is closed for good
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the transport can no longer carry frames
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::Connect(_))
    }
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session description is missing or malformed
    #[error("Invalid session info: {0}")]
    InvalidSessionInfo(String),

    /// Session negotiation failed
    #[error("Session negotiation failed: {0}")]
    Negotiation(String),

    /// Invalid port forwarding parameters
    #[error("Invalid port parameters: {0}")]
    InvalidParameters(String),

    /// Session closed unexpectedly
    #[error("Session closed unexpectedly")]
    UnexpectedClose,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
