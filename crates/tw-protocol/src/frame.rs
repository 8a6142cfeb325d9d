//! Multiplexer frame header encoding/decoding
//!
//! Sub-streams share one ordered byte stream using an 8-byte header:
//! - version: 1 byte (always 1)
//! - command: 1 byte (SYN, FIN, PSH, NOP)
//! - length: 2 bytes (u16, little-endian)
//! - stream_id: 4 bytes (u32, little-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::stream::StreamId;

/// Size of the frame header in bytes
pub const MUX_HEADER_SIZE: usize = 8;

/// Protocol version carried in every frame
pub const MUX_VERSION: u8 = 1;

/// Largest data section a frame can carry
pub const MAX_FRAME_DATA: usize = u16::MAX as usize;

/// Multiplexer frame command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MuxCommand {
    /// Open a stream
    Syn = 0,
    /// Close the sender's half of a stream
    Fin = 1,
    /// Stream data
    Psh = 2,
    /// Keepalive
    Nop = 3,
}

impl MuxCommand {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Syn),
            1 => Some(Self::Fin),
            2 => Some(Self::Psh),
            3 => Some(Self::Nop),
            _ => None,
        }
    }
}

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxFrameHeader {
    /// Frame command
    pub command: MuxCommand,
    /// Length of the data section in bytes
    pub length: u16,
    /// Stream this frame belongs to
    pub stream_id: StreamId,
}

impl MuxFrameHeader {
    /// Create a new frame header
    pub fn new(command: MuxCommand, length: u16, stream_id: StreamId) -> Self {
        Self {
            command,
            length,
            stream_id,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(MUX_HEADER_SIZE);
        dst.put_u8(MUX_VERSION);
        dst.put_u8(self.command.as_u8());
        dst.put_u16_le(self.length);
        dst.put_u32_le(self.stream_id.as_u32());
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err on a version or command this side does not speak.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < MUX_HEADER_SIZE {
            return Ok(None);
        }

        // Validate before consuming anything
        let version = src[0];
        if version != MUX_VERSION {
            return Err(ProtocolError::UnsupportedMuxVersion(version));
        }
        let command = MuxCommand::from_u8(src[1]).ok_or(ProtocolError::UnknownCommand(src[1]))?;

        src.advance(2);
        let length = src.get_u16_le();
        let stream_id = StreamId::new(src.get_u32_le());

        Ok(Some(Self {
            command,
            length,
            stream_id,
        }))
    }
}
