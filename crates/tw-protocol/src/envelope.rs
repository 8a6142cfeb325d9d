//! Envelope encoding/decoding
//!
//! Every message exchanged with the remote agent is a single envelope with a
//! fixed 120-byte header followed by the payload. All integers are
//! big-endian:
//!
//! ```text
//! offset  size  field
//!      0     4  header_length   (u32, always 116)
//!      4    32  message_type    (ASCII, space padded)
//!     36     4  schema_version  (u32)
//!     40     8  created_date    (u64, Unix millis)
//!     48     8  sequence_number (i64)
//!     56     8  flags           (u64)
//!     64    16  message_id      (UUID, low 8 bytes first)
//!     80    32  payload_digest  (SHA-256 of payload)
//!    112     4  payload_type    (u32)
//!    116     4  payload_length  (u32)
//!    120     n  payload
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::message::{Flags, MessageType, PayloadType};

/// Value of the header length field
pub const HEADER_LENGTH: u32 = 116;

/// Bytes before the payload starts
pub const HEADER_SIZE: usize = HEADER_LENGTH as usize + 4;

/// Width of the message type field
pub const MESSAGE_TYPE_LENGTH: usize = 32;

/// Width of the payload digest field
pub const DIGEST_LENGTH: usize = 32;

/// Offset of the payload length field
pub const PAYLOAD_LENGTH_OFFSET: usize = 116;

/// Schema version written by this client
pub const SCHEMA_VERSION: u32 = 1;

/// Highest schema version this client accepts
pub const MAX_SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// Maximum payload carried by one envelope
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// The wire unit exchanged with the remote agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Kind of envelope
    pub message_type: MessageType,
    /// Layout version
    pub schema_version: u32,
    /// Creation time in Unix milliseconds
    pub created_date: u64,
    /// Per-direction sequence number, starting at 0
    pub sequence_number: i64,
    /// Flag bits
    pub flags: Flags,
    /// Unique id of this envelope
    pub message_id: Uuid,
    /// SHA-256 of `payload`
    pub payload_digest: [u8; DIGEST_LENGTH],
    /// Raw payload sub-kind, see [`PayloadType`]
    pub payload_type: u32,
    /// Payload bytes
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope with a fresh id, timestamp and digest
    pub fn new(
        message_type: MessageType,
        sequence_number: i64,
        payload_type: PayloadType,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        Self {
            message_type,
            schema_version: SCHEMA_VERSION,
            created_date: current_time_millis(),
            sequence_number,
            flags: Flags::DATA,
            message_id: Uuid::new_v4(),
            payload_digest: digest(&payload),
            payload_type: payload_type.as_u32(),
            payload,
        }
    }

    /// Replace the flag bits
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Typed payload kind, if known
    pub fn payload_kind(&self) -> Option<PayloadType> {
        PayloadType::from_u32(self.payload_type)
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst);
        dst.freeze()
    }

    /// Encode into an existing buffer
    ///
    /// The stored digest is written as is; it is computed when the envelope
    /// is created.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32(HEADER_LENGTH);

        let name = self.message_type.as_str().as_bytes();
        dst.put_slice(name);
        dst.put_bytes(b' ', MESSAGE_TYPE_LENGTH - name.len());

        dst.put_u32(self.schema_version);
        dst.put_u64(self.created_date);
        dst.put_i64(self.sequence_number);
        dst.put_u64(self.flags.bits());

        // The agent stores the low half of the UUID first
        let id = self.message_id.as_bytes();
        dst.put_slice(&id[8..16]);
        dst.put_slice(&id[0..8]);

        dst.put_slice(&self.payload_digest);
        dst.put_u32(self.payload_type);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    /// Decode and validate one complete envelope
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: HEADER_SIZE,
                actual: src.len(),
            });
        }

        let mut buf = src;

        let header_length = buf.get_u32();
        if header_length != HEADER_LENGTH {
            return Err(ProtocolError::InvalidHeaderLength(header_length));
        }

        let raw_name = &buf[..MESSAGE_TYPE_LENGTH];
        let name = String::from_utf8_lossy(raw_name);
        let name = name.trim_end_matches([' ', '\0']);
        let message_type = MessageType::from_name(name)
            .ok_or_else(|| ProtocolError::UnknownMessageType(name.to_string()))?;
        buf.advance(MESSAGE_TYPE_LENGTH);

        let schema_version = buf.get_u32();
        if schema_version == 0 || schema_version > MAX_SUPPORTED_SCHEMA_VERSION {
            return Err(ProtocolError::UnsupportedSchemaVersion(schema_version));
        }

        let created_date = buf.get_u64();
        let sequence_number = buf.get_i64();
        let flags = Flags(buf.get_u64());

        let mut id = [0u8; 16];
        id[8..16].copy_from_slice(&buf[..8]);
        id[0..8].copy_from_slice(&buf[8..16]);
        buf.advance(16);
        let message_id = Uuid::from_bytes(id);

        let mut payload_digest = [0u8; DIGEST_LENGTH];
        payload_digest.copy_from_slice(&buf[..DIGEST_LENGTH]);
        buf.advance(DIGEST_LENGTH);

        let payload_type = buf.get_u32();
        let payload_length = buf.get_u32() as usize;

        if buf.remaining() != payload_length {
            return Err(ProtocolError::PayloadLengthMismatch {
                declared: payload_length,
                actual: buf.remaining(),
            });
        }

        let payload = Bytes::copy_from_slice(buf);
        let computed = digest(&payload);
        if computed != payload_digest {
            return Err(ProtocolError::DigestMismatch {
                expected: hex::encode(payload_digest),
                actual: hex::encode(computed),
            });
        }

        Ok(Self {
            message_type,
            schema_version,
            created_date,
            sequence_number,
            flags,
            message_id,
            payload_digest,
            payload_type,
            payload,
        })
    }

    /// Total envelope length announced by a header prefix
    ///
    /// Returns `None` until the first [`HEADER_SIZE`] bytes are available.
    pub fn peek_len(src: &[u8]) -> Option<usize> {
        if src.len() < HEADER_SIZE {
            return None;
        }
        let mut length_field = &src[PAYLOAD_LENGTH_OFFSET..HEADER_SIZE];
        Some(HEADER_SIZE + length_field.get_u32() as usize)
    }
}

/// SHA-256 digest of a payload
pub fn digest(payload: &[u8]) -> [u8; DIGEST_LENGTH] {
    Sha256::digest(payload).into()
}

/// Current time in milliseconds since the Unix epoch
fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(
            MessageType::InputStreamData,
            7,
            PayloadType::Output,
            Bytes::from_static(b"Hello Agent\n"),
        )
        .with_flags(Flags::SYN)
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = sample();
        let encoded = envelope.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 12);

        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_header_offsets() {
        let envelope = sample();
        let encoded = envelope.encode();

        assert_eq!(&encoded[0..4], &HEADER_LENGTH.to_be_bytes());
        assert_eq!(&encoded[4..21], b"input_stream_data");
        assert!(encoded[21..36].iter().all(|b| *b == b' '));
        assert_eq!(&encoded[36..40], &SCHEMA_VERSION.to_be_bytes());
        assert_eq!(&encoded[48..56], &7i64.to_be_bytes());
        assert_eq!(&encoded[56..64], &1u64.to_be_bytes());
        assert_eq!(&encoded[64..72], &envelope.message_id.as_bytes()[8..16]);
        assert_eq!(&encoded[72..80], &envelope.message_id.as_bytes()[0..8]);
        assert_eq!(&encoded[80..112], &digest(b"Hello Agent\n"));
        assert_eq!(&encoded[112..116], &1u32.to_be_bytes());
        assert_eq!(&encoded[116..120], &12u32.to_be_bytes());
        assert_eq!(&encoded[120..], b"Hello Agent\n");
    }

    #[test]
    fn test_truncated_header() {
        let encoded = sample().encode();
        let result = Envelope::decode(&encoded[..HEADER_SIZE - 1]);
        assert!(matches!(
            result,
            Err(ProtocolError::Truncated { expected: HEADER_SIZE, .. })
        ));
    }

    #[test]
    fn test_flipped_payload_byte_is_digest_mismatch() {
        let mut encoded = sample().encode().to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let result = Envelope::decode(&encoded);
        assert!(matches!(result, Err(ProtocolError::DigestMismatch { .. })));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut encoded = sample().encode().to_vec();
        encoded[4..9].copy_from_slice(b"bogus");
        let result = Envelope::decode(&encoded);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageType(_))));
    }

    #[test]
    fn test_unsupported_schema_version() {
        let mut encoded = sample().encode().to_vec();
        encoded[36..40].copy_from_slice(&9u32.to_be_bytes());
        let result = Envelope::decode(&encoded);
        assert!(matches!(
            result,
            Err(ProtocolError::UnsupportedSchemaVersion(9))
        ));
    }

    #[test]
    fn test_payload_length_mismatch() {
        let encoded = sample().encode();
        let result = Envelope::decode(&encoded[..encoded.len() - 2]);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadLengthMismatch {
                declared: 12,
                actual: 10
            })
        ));
    }

    #[test]
    fn test_garbage_never_panics() {
        let mut garbage = vec![0xAB; HEADER_SIZE + 40];
        garbage[0..4].copy_from_slice(&HEADER_LENGTH.to_be_bytes());
        assert!(Envelope::decode(&garbage).is_err());
        assert!(Envelope::decode(&[]).is_err());
        assert!(Envelope::decode(&[0u8; HEADER_SIZE]).is_err());
    }

    #[test]
    fn test_peek_len() {
        let encoded = sample().encode();
        assert_eq!(Envelope::peek_len(&encoded[..10]), None);
        assert_eq!(Envelope::peek_len(&encoded), Some(encoded.len()));
    }
}
