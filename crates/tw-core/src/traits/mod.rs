//! Core trait definitions

mod negotiator;
mod transport;

pub use negotiator::SessionNegotiator;
pub use transport::Transport;
