//! Port session layer
//!
//! Maps local connections onto the channel engine's ordered byte stream.
//! One of three variants is chosen once the handshake completed or timed
//! out, and stays fixed for the session:
//!
//! - [`StandardStreamForwarding`] pipes a reader/writer pair, stdin and
//!   stdout by default
//! - [`BasicPortForwarding`] serves a single local connection at a time
//! - [`MuxPortForwarding`] multiplexes any number of local connections
//!
//! The [`PortSession`] facade drives the chosen variant: it runs the
//! variant's reader, hands every in-order chunk from the channel to the
//! variant's writer, and stops the variant when the channel closes or the
//! caller cancels.

mod basic;
mod listener;
mod mux;
mod standard;

pub use basic::BasicPortForwarding;
pub use listener::{LocalConnection, LocalListener, LocalStream};
pub use mux::MuxPortForwarding;
pub use standard::StandardStreamForwarding;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use tw_channel::{Capabilities, ChannelEngine, ChannelEvent};
use tw_core::{ForwardingType, LocalEndpoint, PortParameters, TunnelError};
use tw_protocol::PayloadType;

/// Bound on stopping a variant and on draining a write once the channel
/// has closed
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwarding variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortVariant {
    StandardStream,
    Basic,
    Mux,
}

impl fmt::Display for PortVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortVariant::StandardStream => write!(f, "StandardStreamForwarding"),
            PortVariant::Basic => write!(f, "BasicPortForwarding"),
            PortVariant::Mux => write!(f, "MuxPortForwarding"),
        }
    }
}

/// Choose the forwarding variant for negotiated capabilities
pub fn select_variant(params: &PortParameters, capabilities: &Capabilities) -> PortVariant {
    if params.forwarding_type != ForwardingType::LocalPortForwarding {
        PortVariant::StandardStream
    } else if capabilities.supports_multiplexing() {
        PortVariant::Mux
    } else {
        PortVariant::Basic
    }
}

/// A forwarding variant
///
/// `read_stream` and `write_stream` run concurrently: the former pumps
/// local bytes into the channel, the latter receives channel output in
/// sequence order.
#[async_trait]
pub trait PortSessionType: Send + Sync {
    /// Variant name for logs
    fn name(&self) -> &'static str;

    /// Bind local resources; returns the listening endpoint, if any
    async fn initialize(&self) -> Result<Option<LocalEndpoint>, TunnelError>;

    /// Pump local input into the channel
    ///
    /// Returns `Ok(())` when cancelled or when the variant has nothing left
    /// to serve, and the fatal error otherwise.
    async fn read_stream(&self, cancel: CancellationToken) -> Result<(), TunnelError>;

    /// Deliver one in-order chunk of channel output
    ///
    /// Errors are scoped to the local connection and logged by the caller.
    async fn write_stream(&self, payload_type: PayloadType, payload: Bytes)
        -> Result<(), TunnelError>;

    /// Close local resources
    async fn stop(&self);
}

/// Facade running the selected variant
pub struct PortSession {
    variant: Arc<dyn PortSessionType>,
    engine: Arc<ChannelEngine>,
    endpoint: watch::Sender<Option<LocalEndpoint>>,
}

impl PortSession {
    /// Wrap a variant
    pub fn new(
        variant: Arc<dyn PortSessionType>,
        engine: Arc<ChannelEngine>,
        endpoint: watch::Sender<Option<LocalEndpoint>>,
    ) -> Self {
        Self {
            variant,
            engine,
            endpoint,
        }
    }

    /// Run until cancelled or the channel ends
    ///
    /// Returns `Ok(())` on cancellation, remote close, or when the variant
    /// finishes on its own, and the fatal channel error otherwise.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let name = self.variant.name();
        let endpoint = self.variant.initialize().await?;
        if let Some(endpoint) = &endpoint {
            tracing::info!("{} listening on {}", name, endpoint);
        }
        self.endpoint.send_replace(endpoint);

        let reader_cancel = cancel.child_token();
        let mut reader = {
            let variant = self.variant.clone();
            let cancel = reader_cancel.clone();
            tokio::spawn(async move { variant.read_stream(cancel).await })
        };

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("{} cancelled", name);
                    break Ok(());
                }
                result = &mut reader => {
                    break match result {
                        Ok(Ok(())) => {
                            tracing::debug!("{} finished", name);
                            Ok(())
                        }
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(TunnelError::ChannelClosed(format!("{} reader failed: {}", name, e))),
                    };
                }
                event = events.recv() => match event {
                    Some(ChannelEvent::Output { payload_type, payload }) => {
                        if !self.deliver(payload_type, payload, &cancel).await {
                            if cancel.is_cancelled() {
                                tracing::info!("{} cancelled during a local write", name);
                                break Ok(());
                            }
                            break self.closed_result("local write stalled").await;
                        }
                    }
                    Some(ChannelEvent::Closed { reason }) => {
                        break self.closed_result(&reason).await;
                    }
                    None => break Ok(()),
                },
            }
        };

        reader_cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, self.variant.stop()).await.is_err() {
            tracing::warn!("{} did not stop within {:?}", name, STOP_TIMEOUT);
        }
        if !reader.is_finished() && tokio::time::timeout(STOP_TIMEOUT, &mut reader).await.is_err() {
            tracing::warn!("{} reader did not finish within {:?}, aborting", name, STOP_TIMEOUT);
            reader.abort();
        }
        self.endpoint.send_replace(None);
        result
    }

    /// Hand one chunk to the variant's writer
    ///
    /// Returns false when the write was abandoned: on cancellation, or when
    /// it is still pending `STOP_TIMEOUT` after the channel closed.
    async fn deliver(&self, payload_type: PayloadType, payload: Bytes, cancel: &CancellationToken) -> bool {
        let drain_deadline = async {
            self.engine.closed().await;
            tokio::time::sleep(STOP_TIMEOUT).await;
        };
        tokio::select! {
            written = self.variant.write_stream(payload_type, payload) => {
                if let Err(e) = written {
                    tracing::warn!("{} write failed: {}", self.variant.name(), e);
                }
                true
            }
            _ = cancel.cancelled() => false,
            _ = drain_deadline => {
                tracing::warn!("{} local write stalled after channel close", self.variant.name());
                false
            }
        }
    }

    /// Session result once the channel has closed
    async fn closed_result(&self, reason: &str) -> Result<(), TunnelError> {
        match self.engine.take_error().await {
            Some(e) => Err(e),
            None => {
                tracing::info!("Channel closed: {}", reason);
                Ok(())
            }
        }
    }
}
