//! Session negotiation backed by a pre-obtained session

use async_trait::async_trait;

use crate::error::SessionError;
use crate::traits::SessionNegotiator;
use crate::types::{SessionInfo, StartSessionRequest};

/// Serves a session that was started out of band
///
/// Cloud tooling prints a `{SessionId, TokenValue, StreamUrl}` document when
/// it starts a session; this negotiator hands that document back for any
/// request.
#[derive(Debug, Clone)]
pub struct StaticNegotiator {
    info: SessionInfo,
}

impl StaticNegotiator {
    /// Wrap an already negotiated session
    pub fn new(info: SessionInfo) -> Self {
        Self { info }
    }

    /// Parse the session document
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        Ok(Self::new(SessionInfo::from_json(json)?))
    }
}

#[async_trait]
impl SessionNegotiator for StaticNegotiator {
    async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<SessionInfo, SessionError> {
        tracing::info!(
            "Using session {} for target {} (document: {})",
            self.info.session_id,
            request.target,
            request.document_name
        );
        Ok(self.info.clone())
    }
}
