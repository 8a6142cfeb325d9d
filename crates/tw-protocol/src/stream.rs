//! Multiplexed sub-stream identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a multiplexed sub-stream
///
/// The side that opens a stream picks its id: clients use odd ids,
/// servers use even ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Create a new stream ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether the stream was opened by the client side
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }

    /// First id a client opens
    pub const FIRST_CLIENT: StreamId = StreamId(1);

    /// First id a server opens
    pub const FIRST_SERVER: StreamId = StreamId(2);
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
