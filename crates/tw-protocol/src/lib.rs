//! tw-protocol: Wire protocol for tunnelwire
//!
//! This crate defines the binary envelope exchanged with the remote agent
//! over the session transport, the typed payloads carried inside it, and
//! the frame format used to multiplex many sub-streams over one channel.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod message;
pub mod payload;
pub mod stream;

pub use codec::{EnvelopeFramer, MuxCodec, MuxFrame};
pub use envelope::{Envelope, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use error::ProtocolError;
pub use frame::{MuxCommand, MuxFrameHeader, MUX_HEADER_SIZE};
pub use message::{Flags, MessageType, PayloadType};
pub use payload::{AcknowledgeContent, PortFlag};
pub use stream::StreamId;
