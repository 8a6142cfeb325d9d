//! Outgoing buffer of unacknowledged envelopes

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tw_core::TunnelError;

/// A sent envelope waiting for its acknowledgement
#[derive(Debug, Clone)]
pub struct OutgoingEntry {
    /// Sequence number of the envelope
    pub sequence_number: i64,
    /// Encoded envelope, retransmitted unmodified
    pub raw: Bytes,
    /// When the entry was buffered
    pub first_sent: Instant,
    /// Last transmission
    pub last_sent: Instant,
    /// Transmissions so far; 0 while publication is paused
    pub attempts: u32,
}

/// Unacknowledged envelopes keyed by sequence number
#[derive(Debug)]
pub struct OutgoingBuffer {
    entries: BTreeMap<i64, OutgoingEntry>,
    capacity: usize,
}

impl OutgoingBuffer {
    /// Create an empty buffer
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of unacknowledged entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every sent envelope was acknowledged
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence numbers still waiting, lowest first
    pub fn sequence_numbers(&self) -> Vec<i64> {
        self.entries.keys().copied().collect()
    }

    /// Buffer a new envelope
    pub fn insert(
        &mut self,
        sequence_number: i64,
        raw: Bytes,
        now: Instant,
        transmitted: bool,
    ) -> Result<(), TunnelError> {
        if self.entries.len() >= self.capacity {
            return Err(TunnelError::OutgoingBufferOverflow {
                capacity: self.capacity,
            });
        }
        self.entries.insert(
            sequence_number,
            OutgoingEntry {
                sequence_number,
                raw,
                first_sent: now,
                last_sent: now,
                attempts: u32::from(transmitted),
            },
        );
        Ok(())
    }

    /// Remove the acknowledged entry, if still present
    pub fn acknowledge(&mut self, sequence_number: i64) -> Option<OutgoingEntry> {
        self.entries.remove(&sequence_number)
    }

    /// Collect entries due for (re)transmission and mark them sent
    ///
    /// An entry is due once `rto` has passed since its last transmission, or
    /// immediately if it was never transmitted. Fails with
    /// [`TunnelError::ResendTimeout`] once an entry used up `max_attempts`.
    pub fn take_due(
        &mut self,
        now: Instant,
        rto: Duration,
        max_attempts: u32,
    ) -> Result<Vec<Bytes>, TunnelError> {
        let mut due = Vec::new();
        for entry in self.entries.values_mut() {
            let elapsed = now.saturating_duration_since(entry.last_sent);
            if entry.attempts > 0 && elapsed < rto {
                continue;
            }
            if entry.attempts >= max_attempts {
                return Err(TunnelError::ResendTimeout {
                    sequence_number: entry.sequence_number,
                    attempts: entry.attempts,
                });
            }
            entry.attempts += 1;
            entry.last_sent = now;
            due.push(entry.raw.clone());
        }
        Ok(due)
    }
}
