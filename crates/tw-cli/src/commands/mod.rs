//! CLI command implementations

mod forward;

pub use forward::{forward_command, run_forward, ForwardOptions};
