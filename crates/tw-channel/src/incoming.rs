//! Inbound reorder buffer
//!
//! Stream data may arrive out of order or more than once. Envelopes ahead
//! of the next expected sequence number are held until the gap is filled;
//! envelopes behind it have already been delivered and are discarded.

use std::collections::BTreeMap;

use tw_core::TunnelError;
use tw_protocol::Envelope;

/// Outcome of offering an envelope to the buffer
#[derive(Debug)]
pub enum Accepted {
    /// These envelopes are next in sequence, in delivery order
    Deliver(Vec<Envelope>),
    /// Held until the gap before it is filled
    Buffered,
    /// Already delivered or already held
    Duplicate,
}

/// Bounded reorder buffer for inbound stream data
#[derive(Debug)]
pub struct IncomingBuffer {
    /// Next sequence number to deliver
    expected: i64,
    /// Envelopes received ahead of `expected`
    pending: BTreeMap<i64, Envelope>,
    /// Maximum number of held envelopes
    capacity: usize,
}

impl IncomingBuffer {
    /// Create an empty buffer expecting sequence 0
    pub fn new(capacity: usize) -> Self {
        Self {
            expected: 0,
            pending: BTreeMap::new(),
            capacity,
        }
    }

    /// Next sequence number to deliver
    pub fn expected(&self) -> i64 {
        self.expected
    }

    /// Number of held envelopes
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Offer a received envelope
    ///
    /// Fails with [`TunnelError::SequenceGapOverflow`] when a new envelope
    /// would have to be held while the buffer is full.
    pub fn accept(&mut self, envelope: Envelope) -> Result<Accepted, TunnelError> {
        let seq = envelope.sequence_number;

        if seq < self.expected || self.pending.contains_key(&seq) {
            return Ok(Accepted::Duplicate);
        }

        if seq > self.expected {
            if self.pending.len() >= self.capacity {
                return Err(TunnelError::SequenceGapOverflow {
                    capacity: self.capacity,
                });
            }
            self.pending.insert(seq, envelope);
            return Ok(Accepted::Buffered);
        }

        let mut ready = vec![envelope];
        self.expected += 1;
        while let Some(next) = self.pending.remove(&self.expected) {
            ready.push(next);
            self.expected += 1;
        }
        Ok(Accepted::Deliver(ready))
    }
}
