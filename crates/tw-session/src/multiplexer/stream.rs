//! Sub-stream handle

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use tw_protocol::{MuxFrame, StreamId};

/// Receiving side of a registered sub-stream
pub(crate) type StreamRegistry = Arc<DashMap<StreamId, mpsc::UnboundedSender<Bytes>>>;

/// One multiplexed byte stream
///
/// Reads yield the PSH data the peer sent on this stream and end when the
/// peer half-closes it. Writes are split into PSH frames of at most the
/// configured frame size. Shutting down, or dropping the handle, sends FIN.
pub struct MuxStream {
    id: StreamId,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    frames: PollSender<MuxFrame>,
    /// Plain sender for the FIN sent from `Drop`
    fin_sender: mpsc::Sender<MuxFrame>,
    registry: StreamRegistry,
    max_frame_size: usize,
    fin_sent: bool,
}

impl MuxStream {
    pub(crate) fn new(
        id: StreamId,
        incoming: mpsc::UnboundedReceiver<Bytes>,
        frames: mpsc::Sender<MuxFrame>,
        registry: StreamRegistry,
        max_frame_size: usize,
    ) -> Self {
        Self {
            id,
            incoming,
            pending: Bytes::new(),
            frames: PollSender::new(frames.clone()),
            fin_sender: frames,
            registry,
            max_frame_size,
            fin_sent: false,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> StreamId {
        self.id
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "multiplexer session closed")
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match ready!(self.incoming.poll_recv(cx)) {
                Some(data) => self.pending = data,
                // Peer sent FIN or the session ended
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fin_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream already shut down",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(self.frames.poll_reserve(cx)).map_err(|_| broken_pipe())?;

        let n = buf.len().min(self.max_frame_size);
        let frame = MuxFrame::psh(self.id, Bytes::copy_from_slice(&buf[..n]));
        self.frames.send_item(frame).map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fin_sent {
            return Poll::Ready(Ok(()));
        }

        ready!(self.frames.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let id = self.id;
        self.frames
            .send_item(MuxFrame::fin(id))
            .map_err(|_| broken_pipe())?;
        self.fin_sent = true;
        tracing::trace!("Sent FIN on {}", id);
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        if !self.fin_sent {
            // Best effort; a full queue or a closed session needs no FIN
            let _ = self.fin_sender.try_send(MuxFrame::fin(self.id));
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("fin_sent", &self.fin_sent)
            .finish()
    }
}
