//! Transport over a byte stream
//!
//! Envelopes carry their own length, so any ordered byte stream (a TCP
//! socket, a pipe) can serve as a transport by splitting it with the
//! envelope framer.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tw_protocol::EnvelopeFramer;

use crate::error::TransportError;
use crate::traits::Transport;

/// Envelope transport over an `AsyncRead + AsyncWrite` stream
pub struct StreamTransport<T> {
    /// Write half (async mutex for holding across awaits)
    sink: Mutex<SplitSink<Framed<T, EnvelopeFramer>, Bytes>>,
    /// Read half
    stream: Mutex<SplitStream<Framed<T, EnvelopeFramer>>>,
    closed: CancellationToken,
}

impl<T> StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a connected stream
    pub fn new(io: T) -> Self {
        let (sink, stream) = Framed::new(io, EnvelopeFramer::new()).split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<T> Transport for StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(data)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&self) -> Option<Result<Bytes, TransportError>> {
        let mut stream = self.stream.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = stream.next() => match frame {
                Some(Ok(raw)) => Some(Ok(raw)),
                // Framing is lost once the length fields are bad
                Some(Err(e)) => Some(Err(TransportError::Receive(e.to_string()))),
                None => None,
            },
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_protocol::{Envelope, MessageType, PayloadType};

    #[tokio::test]
    async fn test_envelopes_over_duplex_pipe() {
        let (left, right) = tokio::io::duplex(64);
        let client = StreamTransport::new(left);
        let agent = StreamTransport::new(right);

        let envelope = Envelope::new(
            MessageType::InputStreamData,
            0,
            PayloadType::Output,
            Bytes::from(vec![7u8; 500]),
        );

        let sender = tokio::spawn(async move {
            client.send(envelope.encode()).await.unwrap();
            client
        });

        let raw = agent.recv().await.unwrap().unwrap();
        let decoded = Envelope::decode(&raw).unwrap();
        assert_eq!(decoded.payload.len(), 500);

        let client = sender.await.unwrap();
        client.close().await.unwrap();
        assert!(agent.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_receive_error() {
        let (left, right) = tokio::io::duplex(64);
        let agent = StreamTransport::new(right);

        let mut left = left;
        tokio::io::AsyncWriteExt::write_all(&mut left, &[0, 0, 0, 1, 0, 0, 0, 0])
            .await
            .unwrap();

        assert!(matches!(
            agent.recv().await,
            Some(Err(TransportError::Receive(_)))
        ));
    }
}
