//! Standard stream forwarding

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tw_channel::ChannelEngine;
use tw_core::{LocalEndpoint, TunnelError};
use tw_protocol::PayloadType;

use super::PortSessionType;

type Input = Box<dyn AsyncRead + Send + Unpin>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Pipes a reader/writer pair 1:1 through the channel
pub struct StandardStreamForwarding {
    engine: Arc<ChannelEngine>,
    input: Mutex<Input>,
    output: Mutex<Output>,
    chunk_size: usize,
}

impl StandardStreamForwarding {
    /// Forward the given reader and writer
    pub fn new<R, W>(engine: Arc<ChannelEngine>, input: R, output: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let chunk_size = engine.config().stream_chunk_size;
        Self {
            engine,
            input: Mutex::new(Box::new(input)),
            output: Mutex::new(Box::new(output)),
            chunk_size,
        }
    }

    /// Forward the process's stdin and stdout
    pub fn stdio(engine: Arc<ChannelEngine>) -> Self {
        Self::new(engine, tokio::io::stdin(), tokio::io::stdout())
    }
}

#[async_trait]
impl PortSessionType for StandardStreamForwarding {
    fn name(&self) -> &'static str {
        "StandardStreamForwarding"
    }

    async fn initialize(&self) -> Result<Option<LocalEndpoint>, TunnelError> {
        Ok(None)
    }

    async fn read_stream(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let mut input = self.input.lock().await;
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = input.read(&mut buf) => read?,
            };
            if n == 0 {
                tracing::debug!("Local input closed");
                return Ok(());
            }
            if let Err(e) = self
                .engine
                .send(PayloadType::Output, Bytes::copy_from_slice(&buf[..n]))
                .await
            {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!("Send failed, left for resend: {}", e);
            }
        }
    }

    async fn write_stream(&self, payload_type: PayloadType, payload: Bytes) -> Result<(), TunnelError> {
        match payload_type {
            PayloadType::Output | PayloadType::StdErr => {
                let mut output = self.output.lock().await;
                output.write_all(&payload).await?;
                output.flush().await?;
            }
            PayloadType::ExitCode => tracing::debug!("Remote exit code received"),
            other => tracing::debug!("Ignoring {:?} payload", other),
        }
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.output.lock().await.flush().await;
    }
}
