//! tunnelwire: SSH-style port forwarding over a remote session channel
//!
//! Provides the `tunnelwire` CLI: forward-spec parsing, the WebSocket
//! transport to the session endpoint, and the status output consumed by
//! scripts.

pub mod commands;
pub mod forward;
pub mod output;
pub mod ready;
pub mod websocket;
