//! Multiplexed port forwarding
//!
//! The multiplexer runs over one end of an in-process pipe. The other end
//! is the carrier: bytes read from it are sent as channel stream data, and
//! channel output is written into it. Every accepted local connection gets
//! its own sub-stream and a bidirectional copy task.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use tw_channel::ChannelEngine;
use tw_core::{LocalEndpoint, MuxConfig, PortParameters, TunnelError};
use tw_protocol::{PayloadType, PortFlag, MUX_HEADER_SIZE};

use super::listener::{LocalConnection, LocalListener};
use super::PortSessionType;
use crate::multiplexer::{MuxSession, MuxStream};

/// Capacity of the in-process pipe under the multiplexer
const CARRIER_BUFFER_SIZE: usize = 256 * 1024;

/// Channel side of the carrier pipe
struct Carrier {
    reader: Mutex<Option<ReadHalf<DuplexStream>>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
}

/// Forwards many local connections over one channel
pub struct MuxPortForwarding {
    engine: Arc<ChannelEngine>,
    params: PortParameters,
    config: MuxConfig,
    listener: Mutex<Option<LocalListener>>,
    mux: Mutex<Option<Arc<MuxSession>>>,
    carrier: Mutex<Option<Arc<Carrier>>>,
}

impl MuxPortForwarding {
    /// Create the variant
    pub fn new(engine: Arc<ChannelEngine>, params: PortParameters, config: MuxConfig) -> Self {
        Self {
            engine,
            params,
            config,
            listener: Mutex::new(None),
            mux: Mutex::new(None),
            carrier: Mutex::new(None),
        }
    }

    /// The multiplexer session, once initialized
    pub async fn mux(&self) -> Option<Arc<MuxSession>> {
        self.mux.lock().await.clone()
    }

    /// Pump carrier bytes into the channel
    async fn pump_carrier(
        engine: Arc<ChannelEngine>,
        mut reader: ReadHalf<DuplexStream>,
        chunk_size: usize,
    ) -> Result<(), TunnelError> {
        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            if let Err(e) = engine
                .send(PayloadType::Output, Bytes::copy_from_slice(&buf[..n]))
                .await
            {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!("Carrier send failed, left for resend: {}", e);
            }
        }
    }
}

/// Copy between a local connection and its sub-stream
///
/// Whichever direction ends first, by EOF or error, closes both ends.
async fn serve_connection(conn: LocalConnection, stream: MuxStream, peer: String) {
    let id = stream.id();
    let (mut conn_reader, mut conn_writer) = tokio::io::split(conn);
    let (mut stream_reader, mut stream_writer) = tokio::io::split(stream);

    tokio::select! {
        sent = tokio::io::copy(&mut conn_reader, &mut stream_writer) => match sent {
            Ok(n) => tracing::debug!("Connection {} on {} closed locally after {} bytes out", peer, id, n),
            Err(e) => tracing::debug!("Connection {} on {} failed: {}", peer, id, e),
        },
        received = tokio::io::copy(&mut stream_reader, &mut conn_writer) => match received {
            Ok(n) => tracing::debug!("Sub-stream {} for {} closed remotely after {} bytes in", id, peer, n),
            Err(e) => tracing::debug!("Sub-stream {} for {} failed: {}", id, peer, e),
        },
    }

    let _ = conn_writer.shutdown().await;
    let _ = stream_writer.shutdown().await;
}

#[async_trait]
impl PortSessionType for MuxPortForwarding {
    fn name(&self) -> &'static str {
        "MuxPortForwarding"
    }

    async fn initialize(&self) -> Result<Option<LocalEndpoint>, TunnelError> {
        let listener = LocalListener::bind(&self.params).await?;
        let endpoint = listener.local_endpoint()?;

        let (local, channel) = tokio::io::duplex(CARRIER_BUFFER_SIZE);
        let mux = MuxSession::client(local, self.config.clone());
        let (reader, writer) = tokio::io::split(channel);

        *self.listener.lock().await = Some(listener);
        *self.mux.lock().await = Some(mux);
        *self.carrier.lock().await = Some(Arc::new(Carrier {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(writer),
        }));
        Ok(Some(endpoint))
    }

    async fn read_stream(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let not_initialized = || TunnelError::ChannelClosed("multiplexer not initialized".into());
        let listener = self.listener.lock().await.take().ok_or_else(not_initialized)?;
        let mux = self.mux.lock().await.clone().ok_or_else(not_initialized)?;
        let carrier = self.carrier.lock().await.clone().ok_or_else(not_initialized)?;
        let reader = carrier.reader.lock().await.take().ok_or_else(not_initialized)?;

        // Whole frames fit one envelope at the default sizes
        let chunk_size = self.config.max_frame_size + MUX_HEADER_SIZE;
        let mut pump = tokio::spawn(Self::pump_carrier(self.engine.clone(), reader, chunk_size));
        let mut connections = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                pumped = &mut pump => {
                    break match pumped {
                        Ok(result) => result,
                        Err(e) => Err(TunnelError::ChannelClosed(format!("carrier pump failed: {}", e))),
                    };
                }
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    match mux.open_stream().await {
                        Ok(stream) => {
                            tracing::info!("Connection accepted from {} on {}", peer, stream.id());
                            connections.spawn(serve_connection(conn, stream, peer));
                        }
                        Err(e) => break Err(e),
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        // Aborted copy tasks drop their sub-streams, which sends FIN
        connections.shutdown().await;
        if !pump.is_finished() {
            pump.abort();
        }
        result
    }

    async fn write_stream(&self, payload_type: PayloadType, payload: Bytes) -> Result<(), TunnelError> {
        match payload_type {
            PayloadType::Output => {
                let Some(carrier) = self.carrier.lock().await.clone() else {
                    return Ok(());
                };
                let mut writer = carrier.writer.lock().await;
                writer.write_all(&payload).await?;
                Ok(())
            }
            PayloadType::Flag => {
                if let Some(PortFlag::ConnectToPortError) = PortFlag::decode(&payload) {
                    tracing::warn!(
                        "Agent could not connect to remote port {}",
                        self.params.port_number
                    );
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
        if !self.engine.is_closed() {
            if let Err(e) = self.engine.send_flag(PortFlag::TerminateSession).await {
                tracing::debug!("Could not send TerminateSession: {}", e);
            }
        }
        if let Some(mux) = self.mux.lock().await.take() {
            mux.close().await;
        }
        self.carrier.lock().await.take();
        self.listener.lock().await.take();
    }
}
