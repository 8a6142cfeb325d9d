//! Transport implementations that need no network

mod memory;
mod stream;

pub use memory::{MemoryTransport, OutboundHook};
pub use stream::StreamTransport;
