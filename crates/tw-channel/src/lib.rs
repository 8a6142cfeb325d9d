//! tw-channel: Reliable session channel for tunnelwire
//!
//! Turns an unreliable, unordered transport into an ordered, reliable
//! byte channel. Outbound stream data is numbered, buffered and resent
//! until acknowledged; inbound stream data is acknowledged, reordered and
//! deduplicated before delivery. The agent handshake runs over the same
//! channel before any port data flows.

pub mod engine;
pub mod handshake;
pub mod incoming;
pub mod outgoing;
pub mod rtt;
pub mod scheduler;

pub use engine::{ChannelEngine, ChannelEvent};
pub use handshake::{AgentVersion, Capabilities, HandshakeState};
