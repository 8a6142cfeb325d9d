//! Tokio codecs for multiplexer frames and envelope streams

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::{Envelope, HEADER_LENGTH, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::ProtocolError;
use crate::frame::{MuxCommand, MuxFrameHeader, MAX_FRAME_DATA};
use crate::stream::StreamId;

/// A complete multiplexer frame with header and data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// Frame command
    pub command: MuxCommand,
    /// Data section, empty for everything but PSH
    pub data: Bytes,
}

impl MuxFrame {
    /// Create a new frame
    pub fn new(stream_id: StreamId, command: MuxCommand, data: Bytes) -> Self {
        Self {
            stream_id,
            command,
            data,
        }
    }

    /// Stream open
    pub fn syn(stream_id: StreamId) -> Self {
        Self::new(stream_id, MuxCommand::Syn, Bytes::new())
    }

    /// Half close
    pub fn fin(stream_id: StreamId) -> Self {
        Self::new(stream_id, MuxCommand::Fin, Bytes::new())
    }

    /// Stream data
    pub fn psh(stream_id: StreamId, data: Bytes) -> Self {
        Self::new(stream_id, MuxCommand::Psh, data)
    }

    /// Keepalive, always on stream 0
    pub fn nop() -> Self {
        Self::new(StreamId::new(0), MuxCommand::Nop, Bytes::new())
    }
}

/// Codec for encoding/decoding multiplexer frames
#[derive(Debug, Default)]
pub struct MuxCodec {
    /// Current header being decoded (if any)
    pending_header: Option<MuxFrameHeader>,
}

impl MuxCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for MuxCodec {
    type Item = MuxFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match MuxFrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let length = header.length as usize;
        if src.len() < length {
            src.reserve(length - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let data = src.split_to(length).freeze();

        Ok(Some(MuxFrame {
            stream_id: header.stream_id,
            command: header.command,
            data,
        }))
    }
}

impl Encoder<MuxFrame> for MuxCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: MuxFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = frame.data.len();
        if length > MAX_FRAME_DATA {
            return Err(ProtocolError::PayloadTooLarge {
                size: length,
                max: MAX_FRAME_DATA,
            });
        }

        let header = MuxFrameHeader::new(frame.command, length as u16, frame.stream_id);
        header.encode(dst);
        dst.extend_from_slice(&frame.data);

        Ok(())
    }
}

/// Splits a byte stream into whole raw envelopes
///
/// Only the length fields are inspected; the digest and the rest of the
/// header are validated by [`Envelope::decode`], so a corrupt envelope can
/// be dropped without losing framing.
#[derive(Debug, Default)]
pub struct EnvelopeFramer;

impl EnvelopeFramer {
    /// Create a new framer
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EnvelopeFramer {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() >= 4 {
            let header_length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            if header_length != HEADER_LENGTH {
                return Err(ProtocolError::InvalidHeaderLength(header_length));
            }
        }

        let total = match Envelope::peek_len(src) {
            Some(total) => total,
            None => return Ok(None),
        };

        let payload_len = total - HEADER_SIZE;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total).freeze()))
    }
}

impl Encoder<Bytes> for EnvelopeFramer {
    type Error = ProtocolError;

    fn encode(&mut self, raw: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&raw);
        Ok(())
    }
}

impl Encoder<Envelope> for EnvelopeFramer {
    type Error = ProtocolError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if envelope.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: envelope.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        envelope.encode_into(dst);
        Ok(())
    }
}
