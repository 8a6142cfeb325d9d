//! Transport trait

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Message-oriented duplex link to the remote agent
///
/// Each call to [`Transport::send`] carries exactly one encoded envelope and
/// each item yielded by [`Transport::recv`] is one received envelope. The
/// transport may drop, duplicate or reorder frames; the channel engine
/// recovers from all three.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Receive the next frame
    ///
    /// Returns `None` once the transport is closed. Only one task receives.
    async fn recv(&self) -> Option<Result<Bytes, TransportError>>;

    /// Close the transport, waking a pending `recv`
    async fn close(&self) -> Result<(), TransportError>;
}
