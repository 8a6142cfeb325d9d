//! WebSocket transport to the session's stream endpoint
//!
//! The data channel is opened by sending a JSON text frame carrying the
//! session token; every envelope after that travels as one binary frame.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tw_core::{SessionInfo, Transport, TransportError};

/// Interval between keepalive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(5 * 60);

const QUEUE_DEPTH: usize = 64;

/// First frame on a new data channel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OpenDataChannel {
    pub message_schema_version: String,
    pub request_id: String,
    pub token_value: String,
    pub client_id: String,
    pub client_version: String,
}

impl OpenDataChannel {
    pub fn new(token_value: &str, client_id: &str) -> Self {
        Self {
            message_schema_version: "1.0".to_string(),
            request_id: Uuid::new_v4().to_string(),
            token_value: token_value.to_string(),
            client_id: client_id.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Envelope transport over a WebSocket
pub struct WebSocketTransport {
    outgoing: mpsc::Sender<Message>,
    incoming: Mutex<mpsc::Receiver<Result<Bytes, TransportError>>>,
    closed: CancellationToken,
}

impl WebSocketTransport {
    /// Connect to the session's stream URL and open the data channel
    pub async fn connect(info: &SessionInfo, client_id: &str) -> Result<Self, TransportError> {
        tracing::debug!("Connecting to {}", info.stream_url);
        let (ws, _response) = tokio_tungstenite::connect_async(info.stream_url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Self::open(ws, &info.token_value, client_id, PING_INTERVAL).await
    }

    /// Open the data channel on an established WebSocket
    pub async fn open<S>(
        mut ws: WebSocketStream<S>,
        token_value: &str,
        client_id: &str,
        ping_interval: Duration,
    ) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let open = serde_json::to_string(&OpenDataChannel::new(token_value, client_id))
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        ws.send(Message::Text(open))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::info!("Data channel opened (client {})", client_id);

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let closed = CancellationToken::new();

        tokio::spawn(run_writer(sink, out_rx, ping_interval, closed.clone()));
        tokio::spawn(run_reader(stream, in_tx, closed.clone()));

        Ok(Self {
            outgoing: out_tx,
            incoming: Mutex::new(in_rx),
            closed,
        })
    }
}

async fn run_writer<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::Receiver<Message>,
    ping_interval: Duration,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            msg = outgoing.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!("WebSocket send failed: {}", e);
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    tracing::warn!("WebSocket ping failed: {}", e);
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    closed.cancel();
    tracing::debug!("WebSocket writer stopped");
}

async fn run_reader<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    incoming: mpsc::Sender<Result<Bytes, TransportError>>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(Message::Binary(data))) => {
                    if incoming.send(Ok(Bytes::from(data))).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!("WebSocket closed by peer: {:?}", frame);
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("Ignoring text frame ({} bytes)", text.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = incoming.send(Err(TransportError::Receive(e.to_string()))).await;
                    break;
                }
                None => break,
            },
        }
    }
    closed.cancel();
    tracing::debug!("WebSocket reader stopped");
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outgoing
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Result<Bytes, TransportError>> {
        let mut incoming = self.incoming.lock().await;
        // Frames already queued are delivered before the close is seen
        match incoming.try_recv() {
            Ok(frame) => return Some(frame),
            Err(_) if self.closed.is_cancelled() => return None,
            Err(_) => {}
        }
        tokio::select! {
            frame = incoming.recv() => frame,
            _ = self.closed.cancelled() => None,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::{accept_async, client_async};

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client, server) = tokio::join!(
            client_async("ws://localhost/data-channel", client),
            accept_async(server)
        );
        (client.unwrap().0, server.unwrap())
    }

    #[tokio::test]
    async fn test_open_sends_token_then_binary_frames() {
        let (client, mut server) = ws_pair().await;
        let transport = WebSocketTransport::open(client, "tok-1", "client-1", PING_INTERVAL)
            .await
            .unwrap();

        let open = server.next().await.unwrap().unwrap();
        let Message::Text(text) = open else {
            panic!("expected text frame, got {:?}", open);
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["MessageSchemaVersion"], "1.0");
        assert_eq!(json["TokenValue"], "tok-1");
        assert_eq!(json["ClientId"], "client-1");
        assert!(json["RequestId"].as_str().is_some_and(|id| !id.is_empty()));

        transport.send(Bytes::from_static(b"envelope")).await.unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame, Message::Binary(b"envelope".to_vec()));

        server.send(Message::Binary(b"reply".to_vec())).await.unwrap();
        let received = transport.recv().await.unwrap().unwrap();
        assert_eq!(received.as_ref(), b"reply");
    }

    #[tokio::test]
    async fn test_peer_close_ends_recv() {
        let (client, mut server) = ws_pair().await;
        let transport = WebSocketTransport::open(client, "tok", "c", PING_INTERVAL)
            .await
            .unwrap();
        let _open = server.next().await;

        server.close(None).await.unwrap();
        assert!(transport.recv().await.is_none());
        assert!(matches!(
            transport.send(Bytes::from_static(b"late")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping() {
        let (client, mut server) = ws_pair().await;
        let _transport = WebSocketTransport::open(client, "tok", "c", Duration::from_secs(60))
            .await
            .unwrap();
        let _open = server.next().await;

        let frame = tokio::time::timeout(Duration::from_secs(90), server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Message::Ping(_)));
    }
}
