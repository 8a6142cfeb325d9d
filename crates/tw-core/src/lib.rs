//! tw-core: Core abstractions and configuration for tunnelwire
//!
//! This crate provides the error taxonomy, configuration structures, shared
//! session types, and the collaborator traits (transport and session
//! negotiation) used by the channel engine, the port session layer and the
//! CLI.

pub mod config;
pub mod error;
pub mod negotiator;
pub mod time;
pub mod traits;
pub mod transport;
pub mod types;

pub use config::{ChannelConfig, ConfigFile, MuxConfig};
pub use error::{ConfigError, SessionError, TransportError, TunnelError};
pub use negotiator::StaticNegotiator;
pub use traits::{SessionNegotiator, Transport};
pub use transport::{MemoryTransport, StreamTransport};
pub use types::{
    ForwardingType, LocalConnectionType, LocalEndpoint, PortParameters, SessionInfo,
    StartSessionRequest,
};
