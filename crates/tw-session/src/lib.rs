//! tw-session: Port forwarding sessions for tunnelwire
//!
//! A [`Session`] runs one reliable channel to the remote agent and maps
//! local connections onto it through the port session layer. With agents
//! that support it, many local connections share the channel through the
//! stream [`multiplexer`].

pub mod multiplexer;
pub mod port;
pub mod session;

pub use multiplexer::{MuxRole, MuxSession, MuxStream};
pub use port::{select_variant, PortSession, PortSessionType, PortVariant};
pub use session::Session;
