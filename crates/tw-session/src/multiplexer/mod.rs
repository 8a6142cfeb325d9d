//! Stream multiplexer
//!
//! Carries any number of independent byte streams over one ordered byte
//! stream using smux v1 framing. The carrier is anything `AsyncRead +
//! AsyncWrite`; under port forwarding it is one end of an in-process pipe
//! whose other end is pumped through the channel engine.
//!
//! # Tasks
//!
//! A reader task decodes frames and routes PSH data to the stream it
//! belongs to. A writer task serializes frames from every stream and emits
//! keepalives. Both stop when the session is closed or the carrier fails,
//! which ends every sub-stream.

mod stream;

pub use stream::MuxStream;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tw_core::{MuxConfig, TunnelError};
use tw_protocol::{MuxCodec, MuxCommand, MuxFrame, StreamId};

use self::stream::StreamRegistry;

/// Frames queued for the writer task before writers wait
const FRAME_QUEUE_DEPTH: usize = 64;

/// Which end of the multiplexer this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    /// Opens odd-numbered streams
    Client,
    /// Opens even-numbered streams
    Server,
}

/// A multiplexer session over one carrier stream
pub struct MuxSession {
    role: MuxRole,
    config: MuxConfig,
    next_stream_id: AtomicU32,
    streams: StreamRegistry,
    frames: mpsc::Sender<MuxFrame>,
    accept: Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    closed: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MuxSession {
    /// Start a session over `io`
    pub fn new<T>(io: T, role: MuxRole, config: MuxConfig) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let first = match role {
            MuxRole::Client => StreamId::FIRST_CLIENT,
            MuxRole::Server => StreamId::FIRST_SERVER,
        };

        let session = Arc::new(Self {
            role,
            config,
            next_stream_id: AtomicU32::new(first.as_u32()),
            streams: Arc::new(DashMap::new()),
            frames: frames_tx,
            accept: Mutex::new(accept_rx),
            closed: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let (sink, stream) = Framed::new(io, MuxCodec::new()).split();
        let reader = tokio::spawn(session.clone().run_reader(stream, accept_tx));
        let writer = tokio::spawn(session.clone().run_writer(sink, frames_rx));

        // The lock is uncontended right after construction
        if let Ok(mut tasks) = session.tasks.try_lock() {
            tasks.extend([reader, writer]);
        }
        session
    }

    /// Start a client-side session
    pub fn client<T>(io: T, config: MuxConfig) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, MuxRole::Client, config)
    }

    /// Start a server-side session
    pub fn server<T>(io: T, config: MuxConfig) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, MuxRole::Server, config)
    }

    /// This end's role
    pub fn role(&self) -> MuxRole {
        self.role
    }

    /// Number of open sub-streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Open a new sub-stream
    pub async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed("multiplexer closed".into()));
        }

        let id = StreamId::new(self.next_stream_id.fetch_add(2, Ordering::SeqCst));
        let stream = self.register(id);
        self.frames
            .send(MuxFrame::syn(id))
            .await
            .map_err(|_| TunnelError::ChannelClosed("multiplexer closed".into()))?;

        tracing::debug!("Opened {}", id);
        Ok(stream)
    }

    /// Wait for the peer to open a sub-stream
    ///
    /// Returns `None` once the session is closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        let mut accept = self.accept.lock().await;
        tokio::select! {
            biased;
            stream = accept.recv() => stream,
            _ = self.closed.cancelled() => None,
        }
    }

    fn register(&self, id: StreamId) -> MuxStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(id, tx);
        MuxStream::new(
            id,
            rx,
            self.frames.clone(),
            self.streams.clone(),
            self.config.max_frame_size,
        )
    }

    async fn run_reader<S>(self: Arc<Self>, mut frames: S, accept: mpsc::UnboundedSender<MuxStream>)
    where
        S: futures::Stream<Item = Result<MuxFrame, tw_protocol::ProtocolError>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break,
                frame = frames.next() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::warn!("Malformed multiplexer frame, closing session: {}", e);
                    break;
                }
                None => {
                    tracing::debug!("Multiplexer carrier closed");
                    break;
                }
            };

            match frame.command {
                MuxCommand::Syn => {
                    if self.streams.contains_key(&frame.stream_id) {
                        tracing::debug!("Duplicate SYN for {}", frame.stream_id);
                        continue;
                    }
                    let stream = self.register(frame.stream_id);
                    tracing::debug!("Peer opened {}", frame.stream_id);
                    let _ = accept.send(stream);
                }
                MuxCommand::Psh => match self.streams.get(&frame.stream_id) {
                    Some(tx) => {
                        let _ = tx.send(frame.data);
                    }
                    None => tracing::debug!(
                        "Discarding {} bytes for unknown {}",
                        frame.data.len(),
                        frame.stream_id
                    ),
                },
                MuxCommand::Fin => {
                    // Dropping the sender ends the stream's reads
                    if self.streams.remove(&frame.stream_id).is_some() {
                        tracing::debug!("Peer closed {}", frame.stream_id);
                    }
                }
                MuxCommand::Nop => tracing::trace!("Keepalive"),
            }
        }
        self.shutdown();
    }

    async fn run_writer<S>(self: Arc<Self>, mut sink: S, mut frames: mpsc::Receiver<MuxFrame>)
    where
        S: futures::Sink<MuxFrame, Error = tw_protocol::ProtocolError> + Unpin,
    {
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        keepalive.tick().await;

        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = keepalive.tick() => MuxFrame::nop(),
            };

            if let Err(e) = sink.send(frame).await {
                tracing::warn!("Multiplexer write failed: {}", e);
                break;
            }
        }

        // Flush FINs queued by streams dropped during shutdown
        while let Ok(frame) = frames.try_recv() {
            if sink.feed(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // Ends every stream's reads
        self.streams.clear();
        tracing::debug!("Multiplexer session closed");
    }

    /// Close the session and wait for its tasks
    pub async fn close(&self) {
        self.shutdown();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Encoder;

    fn pair() -> (Arc<MuxSession>, Arc<MuxSession>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            MuxSession::client(a, MuxConfig::default()),
            MuxSession::server(b, MuxConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (client, server) = pair();

        let mut local = client.open_stream().await.unwrap();
        assert_eq!(local.id(), StreamId::new(1));
        assert!(local.id().is_client_initiated());

        let mut remote = server.accept_stream().await.unwrap();
        assert_eq!(remote.id(), local.id());

        local.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_stream_ids_alternate_by_role() {
        let (client, server) = pair();

        assert_eq!(client.open_stream().await.unwrap().id(), StreamId::new(1));
        assert_eq!(client.open_stream().await.unwrap().id(), StreamId::new(3));
        assert_eq!(server.open_stream().await.unwrap().id(), StreamId::new(2));
    }

    #[tokio::test]
    async fn test_shutdown_sends_fin() {
        let (client, server) = pair();

        let mut local = client.open_stream().await.unwrap();
        let mut remote = server.accept_stream().await.unwrap();

        local.write_all(b"last words").await.unwrap();
        local.shutdown().await.unwrap();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        assert!(local.write_all(b"more").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_sends_fin() {
        let (client, server) = pair();

        let local = client.open_stream().await.unwrap();
        let mut remote = server.accept_stream().await.unwrap();
        drop(local);

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_large_writes_are_split_into_frames() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let config = MuxConfig {
            max_frame_size: 1024,
            ..Default::default()
        };
        let client = MuxSession::client(a, config.clone());
        let server = MuxSession::server(b, config);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut local = client.open_stream().await.unwrap();
        let mut remote = server.accept_stream().await.unwrap();

        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                local.write_all(&payload).await.unwrap();
                local.shutdown().await.unwrap();
            })
        };

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let server = MuxSession::server(b, MuxConfig::default());

        let mut bytes = BytesMut::new();
        MuxCodec::new()
            .encode(MuxFrame::syn(StreamId::new(1)), &mut bytes)
            .unwrap();
        raw.write_all(&bytes).await.unwrap();
        let mut stream = server.accept_stream().await.unwrap();

        // Version 9 is not smux
        raw.write_all(&[9, 2, 0, 0, 1, 0, 0, 0]).await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(server.accept_stream().await.is_none());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_data_for_unknown_stream_is_discarded() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let server = MuxSession::server(b, MuxConfig::default());

        let mut bytes = BytesMut::new();
        let mut codec = MuxCodec::new();
        codec
            .encode(MuxFrame::psh(StreamId::new(7), Bytes::from_static(b"stray")), &mut bytes)
            .unwrap();
        codec.encode(MuxFrame::syn(StreamId::new(1)), &mut bytes).unwrap();
        codec
            .encode(MuxFrame::psh(StreamId::new(1), Bytes::from_static(b"ok")), &mut bytes)
            .unwrap();
        raw.write_all(&bytes).await.unwrap();

        let mut stream = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        assert!(!server.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_is_sent() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let config = MuxConfig::default();
        let interval = config.keepalive_interval;
        let _server = MuxSession::server(b, config);

        tokio::time::sleep(interval + Duration::from_millis(10)).await;

        let mut header = [0u8; 8];
        raw.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 1);
        assert_eq!(header[1], MuxCommand::Nop.as_u8());
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let (client, server) = pair();

        let mut local = client.open_stream().await.unwrap();
        let _remote = server.accept_stream().await.unwrap();

        client.close().await;
        let mut received = Vec::new();
        local.read_to_end(&mut received).await.unwrap();
        assert!(client.open_stream().await.is_err());
    }
}
