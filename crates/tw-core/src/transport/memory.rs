//! In-process transport pair

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::traits::Transport;

/// Rewrites outbound frames before delivery
///
/// The hook receives each sent frame and returns the frames to deliver in
/// its place: an empty vector drops it, two copies duplicate it, and a hook
/// that stashes frames and releases them later reorders them.
pub type OutboundHook = Box<dyn FnMut(Bytes) -> Vec<Bytes> + Send>;

/// One end of an in-memory transport
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    hook: Mutex<Option<OutboundHook>>,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            hook: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Install a hook applied to every frame sent from this end
    pub async fn set_outbound_hook<F>(&self, hook: F)
    where
        F: FnMut(Bytes) -> Vec<Bytes> + Send + 'static,
    {
        *self.hook.lock().await = Some(Box::new(hook));
    }

    /// Remove the outbound hook
    pub async fn clear_outbound_hook(&self) {
        *self.hook.lock().await = None;
    }

    /// Whether `close` was called on this end
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let frames = match self.hook.lock().await.as_mut() {
            Some(hook) => hook(data),
            None => vec![data],
        };

        let tx = self.tx.lock().await;
        let tx = tx.as_ref().ok_or(TransportError::Closed)?;
        for frame in frames {
            tx.send(frame).map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Result<Bytes, TransportError>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = rx.recv() => frame.map(Ok),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        // Dropping the sender ends the peer's receive loop
        self.tx.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (a, b) = MemoryTransport::pair();
        a.send(Bytes::from_static(b"ping")).await.unwrap();
        b.send(Bytes::from_static(b"pong")).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap().as_ref(), b"ping");
        assert_eq!(a.recv().await.unwrap().unwrap().as_ref(), b"pong");
    }

    #[tokio::test]
    async fn test_hook_drops_and_duplicates() {
        let (a, b) = MemoryTransport::pair();
        a.set_outbound_hook(|frame: Bytes| {
            if frame.as_ref() == b"drop" {
                vec![]
            } else {
                vec![frame.clone(), frame]
            }
        })
        .await;

        a.send(Bytes::from_static(b"drop")).await.unwrap();
        a.send(Bytes::from_static(b"twice")).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap().as_ref(), b"twice");
        assert_eq!(b.recv().await.unwrap().unwrap().as_ref(), b"twice");
    }

    #[tokio::test]
    async fn test_close_ends_both_receivers() {
        let (a, b) = MemoryTransport::pair();
        a.close().await.unwrap();

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(matches!(
            a.send(Bytes::from_static(b"late")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let (a, _b) = MemoryTransport::pair();
        let a = std::sync::Arc::new(a);

        let receiver = {
            let a = a.clone();
            tokio::spawn(async move { a.recv().await })
        };
        tokio::task::yield_now().await;

        a.close().await.unwrap();
        assert!(receiver.await.unwrap().is_none());
    }
}
