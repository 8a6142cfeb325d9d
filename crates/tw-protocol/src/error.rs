//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Fewer bytes than the fixed header requires
    #[error("Truncated envelope: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Header length field does not match the known layout
    #[error("Invalid header length: {0}")]
    InvalidHeaderLength(u32),

    /// Unknown envelope message type
    #[error("Unknown message type: {0:?}")]
    UnknownMessageType(String),

    /// Schema version outside the supported range
    #[error("Unsupported schema version: {0}")]
    UnsupportedSchemaVersion(u32),

    /// Declared payload length disagrees with the bytes present
    #[error("Payload length mismatch: header declares {declared} bytes, {actual} present")]
    PayloadLengthMismatch { declared: usize, actual: usize },

    /// Stored digest does not match the payload
    #[error("Payload digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Unknown multiplexer command byte
    #[error("Unknown multiplexer command: {0}")]
    UnknownCommand(u8),

    /// Multiplexer frame with an unsupported version byte
    #[error("Unsupported multiplexer version: {0}")]
    UnsupportedMuxVersion(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Structured payload could not be parsed or produced
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
