//! Session negotiation trait

use async_trait::async_trait;

use crate::error::SessionError;
use crate::types::{SessionInfo, StartSessionRequest};

/// Starts a session on a target and returns its stream endpoint
#[async_trait]
pub trait SessionNegotiator: Send + Sync {
    /// Start a session
    async fn start_session(&self, request: StartSessionRequest)
        -> Result<SessionInfo, SessionError>;
}
