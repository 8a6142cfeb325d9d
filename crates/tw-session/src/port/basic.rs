//! Single-connection port forwarding
//!
//! Used with agents that cannot multiplex. One local connection (the
//! tenant) is served at a time and its bytes map 1:1 onto the channel;
//! connections arriving while a tenant is active are closed immediately.
//! When the tenant leaves, agents that understand `DisconnectToPort` are
//! told so and the next connection is accepted; older agents end the
//! session instead.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tw_channel::ChannelEngine;
use tw_core::{LocalEndpoint, PortParameters, TunnelError};
use tw_protocol::{PayloadType, PortFlag};

use super::listener::{LocalConnection, LocalListener};
use super::PortSessionType;

/// Active tenant's write side and its cancellation
struct Tenant {
    writer: WriteHalf<LocalConnection>,
    closed: CancellationToken,
}

/// Forwards exactly one local connection at a time
pub struct BasicPortForwarding {
    engine: Arc<ChannelEngine>,
    params: PortParameters,
    reconnect: bool,
    listener: Mutex<Option<LocalListener>>,
    tenant: Mutex<Option<Tenant>>,
}

impl BasicPortForwarding {
    /// Create the variant; `reconnect` is whether the agent honours
    /// `DisconnectToPort`
    pub fn new(engine: Arc<ChannelEngine>, params: PortParameters, reconnect: bool) -> Self {
        Self {
            engine,
            params,
            reconnect,
            listener: Mutex::new(None),
            tenant: Mutex::new(None),
        }
    }

    async fn close_tenant(&self) {
        if let Some(mut tenant) = self.tenant.lock().await.take() {
            tenant.closed.cancel();
            let _ = tenant.writer.shutdown().await;
        }
    }
}

#[async_trait]
impl PortSessionType for BasicPortForwarding {
    fn name(&self) -> &'static str {
        "BasicPortForwarding"
    }

    async fn initialize(&self) -> Result<Option<LocalEndpoint>, TunnelError> {
        let listener = LocalListener::bind(&self.params).await?;
        let endpoint = listener.local_endpoint()?;
        *self.listener.lock().await = Some(listener);
        Ok(Some(endpoint))
    }

    async fn read_stream(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| TunnelError::ChannelClosed("listener not initialized".into()))?;
        let mut buf = vec![0u8; self.engine.config().stream_chunk_size];

        loop {
            let (conn, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            tracing::info!("Connection accepted from {}", peer);

            let (mut reader, writer) = tokio::io::split(conn);
            let closed = CancellationToken::new();
            *self.tenant.lock().await = Some(Tenant {
                writer,
                closed: closed.clone(),
            });

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.close_tenant().await;
                        return Ok(());
                    }
                    _ = closed.cancelled() => break,
                    extra = listener.accept() => {
                        if let Ok((extra, peer)) = extra {
                            tracing::warn!("Rejecting connection from {}: a connection is already active", peer);
                            drop(extra);
                        }
                    }
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Err(e) = self
                                .engine
                                .send(PayloadType::Output, Bytes::copy_from_slice(&buf[..n]))
                                .await
                            {
                                if e.is_fatal() {
                                    self.close_tenant().await;
                                    return Err(e);
                                }
                                tracing::warn!("Send failed, left for resend: {}", e);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Local connection error: {}", e);
                            break;
                        }
                    },
                }
            }

            self.close_tenant().await;
            tracing::info!("Connection from {} closed", peer);

            if !self.reconnect {
                tracing::info!("Agent cannot reuse the port connection, ending session");
                return Ok(());
            }
            self.engine.send_flag(PortFlag::DisconnectToPort).await?;
        }
    }

    async fn write_stream(&self, payload_type: PayloadType, payload: Bytes) -> Result<(), TunnelError> {
        match payload_type {
            PayloadType::Output => {
                let mut tenant = self.tenant.lock().await;
                let Some(active) = tenant.as_mut() else {
                    tracing::debug!("No active connection, dropping {} bytes", payload.len());
                    return Ok(());
                };
                if let Err(e) = active.writer.write_all(&payload).await {
                    active.closed.cancel();
                    tenant.take();
                    return Err(e.into());
                }
                Ok(())
            }
            PayloadType::Flag => {
                match PortFlag::decode(&payload) {
                    Some(PortFlag::ConnectToPortError) => {
                        tracing::warn!(
                            "Agent could not connect to remote port {}",
                            self.params.port_number
                        );
                        self.close_tenant().await;
                    }
                    Some(flag) => tracing::debug!("Ignoring flag {:?}", flag),
                    None => tracing::debug!("Ignoring unknown flag"),
                }
                Ok(())
            }
            other => {
                tracing::debug!("Ignoring {:?} payload", other);
                Ok(())
            }
        }
    }

    async fn stop(&self) {
        self.close_tenant().await;
        self.listener.lock().await.take();
    }
}
