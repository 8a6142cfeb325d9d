//! Port forwarding session
//!
//! A session owns one channel engine over one transport. Running it opens
//! the channel, waits (bounded) for the agent's handshake, picks the
//! forwarding variant from the negotiated capabilities and serves local
//! connections until cancelled or the channel ends.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tw_channel::{Capabilities, ChannelEngine, ChannelEvent};
use tw_core::{ConfigFile, LocalEndpoint, PortParameters, SessionInfo, Transport, TunnelError};

use crate::port::{
    select_variant, BasicPortForwarding, MuxPortForwarding, PortSession, PortSessionType,
    PortVariant, StandardStreamForwarding,
};

type Stdio = (
    Box<dyn AsyncRead + Send + Unpin>,
    Box<dyn AsyncWrite + Send + Unpin>,
);

/// One port forwarding session
pub struct Session {
    info: SessionInfo,
    client_id: String,
    target_id: String,
    config: ConfigFile,
    engine: Arc<ChannelEngine>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    endpoint: watch::Sender<Option<LocalEndpoint>>,
    stdio: Option<Stdio>,
}

impl Session {
    /// Create a session over an open transport
    pub fn new(
        info: SessionInfo,
        target_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: ConfigFile,
    ) -> Self {
        let (engine, events) = ChannelEngine::new(transport, config.channel.clone());
        let (endpoint, _) = watch::channel(None);
        Self {
            info,
            client_id: Uuid::new_v4().to_string(),
            target_id: target_id.into(),
            config,
            engine,
            events: Some(events),
            endpoint,
            stdio: None,
        }
    }

    /// Use the client id the transport opened the data channel with
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Use this reader and writer instead of stdin and stdout for stream
    /// forwarding
    pub fn with_stdio<R, W>(mut self, input: R, output: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.stdio = Some((Box::new(input), Box::new(output)));
        self
    }

    /// Session id assigned by the service
    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    /// Client id sent when the data channel opens
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Target the session runs on
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// The session's channel engine
    pub fn engine(&self) -> &Arc<ChannelEngine> {
        &self.engine
    }

    /// Observe the local endpoint; `Some` while the session is listening
    pub fn listening(&self) -> watch::Receiver<Option<LocalEndpoint>> {
        self.endpoint.subscribe()
    }

    /// Run the session until `cancel` fires or the channel ends
    pub async fn run(mut self, params: PortParameters, cancel: CancellationToken) -> Result<(), TunnelError> {
        params.validate()?;
        tracing::info!(
            "Starting session {} on {} ({})",
            self.info.session_id,
            self.target_id,
            params.describe()
        );

        self.engine.open().await;

        let timeout = self.config.channel.handshake_timeout;
        let handshake = tokio::select! {
            _ = cancel.cancelled() => None,
            handshake = self.engine.wait_for_handshake(timeout) => Some(handshake),
        };

        let capabilities = match handshake {
            None => {
                tracing::info!("Cancelled before the handshake completed");
                return self.finish(Ok(())).await;
            }
            Some(Ok(capabilities)) => capabilities,
            Some(Err(TunnelError::HandshakeTimeout(timeout))) => {
                tracing::warn!(
                    "No handshake from agent within {:?}, using legacy forwarding",
                    timeout
                );
                Capabilities::legacy()
            }
            Some(Err(e)) => {
                let e = self.engine.take_error().await.unwrap_or(e);
                return self.finish(Err(e)).await;
            }
        };

        let variant = select_variant(&params, &capabilities);
        tracing::info!("Using {}", variant);
        let port_variant = self.build_variant(variant, params, &capabilities);

        let port_session = PortSession::new(port_variant, self.engine.clone(), self.endpoint.clone());
        let result = match self.events.take() {
            Some(events) => port_session.run(events, cancel).await,
            None => Err(TunnelError::ChannelClosed("session already ran".into())),
        };
        self.finish(result).await
    }

    fn build_variant(
        &mut self,
        variant: PortVariant,
        params: PortParameters,
        capabilities: &Capabilities,
    ) -> Arc<dyn PortSessionType> {
        let engine = self.engine.clone();
        match variant {
            PortVariant::StandardStream => match self.stdio.take() {
                Some((input, output)) => Arc::new(StandardStreamForwarding::new(engine, input, output)),
                None => Arc::new(StandardStreamForwarding::stdio(engine)),
            },
            PortVariant::Basic => Arc::new(BasicPortForwarding::new(
                engine,
                params,
                capabilities.supports_disconnect_to_port(),
            )),
            PortVariant::Mux => Arc::new(MuxPortForwarding::new(engine, params, self.config.mux.clone())),
        }
    }

    async fn finish(self, result: Result<(), TunnelError>) -> Result<(), TunnelError> {
        if let Err(e) = self.engine.close().await {
            tracing::debug!("Closing transport: {}", e);
        }
        match &result {
            Ok(()) => tracing::info!("Session {} ended", self.info.session_id),
            Err(e) => tracing::error!("Session {} failed: {}", self.info.session_id, e),
        }
        result
    }
}
