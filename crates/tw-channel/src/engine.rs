//! Per-session channel engine
//!
//! The engine owns both sequence counters, the outgoing and incoming
//! buffers and the handshake. Three kinds of task touch that state
//! concurrently: the receive loop, the resend scheduler and the port
//! session pumps calling [`ChannelEngine::send`]. All of it sits behind one
//! async mutex that is never held across a transport send.
//!
//! # Delivery
//!
//! In-order stream data is handed to the port session layer through an
//! unbounded channel of [`ChannelEvent`]s. Events are queued while the
//! state lock is held, so their order is the sequence order.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tw_core::{ChannelConfig, Transport, TransportError, TunnelError};
use tw_protocol::payload::{
    decode_json, encode_json, AcknowledgeContent, ChannelClosed, HandshakeCompletePayload,
    HandshakeRequestPayload,
};
use tw_protocol::{Envelope, Flags, MessageType, PayloadType, PortFlag};

use crate::handshake::{Capabilities, Handshake, HandshakeState};
use crate::incoming::{Accepted, IncomingBuffer};
use crate::outgoing::OutgoingBuffer;
use crate::rtt::RttEstimator;
use crate::scheduler;

/// Events delivered to the port session layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Next in-order chunk of stream data
    Output {
        payload_type: PayloadType,
        payload: Bytes,
    },
    /// The channel terminated; no further events follow
    Closed { reason: String },
}

/// Mutable engine state, guarded by one lock
#[derive(Debug)]
struct EngineState {
    next_outgoing_sequence_number: i64,
    incoming: IncomingBuffer,
    outgoing: OutgoingBuffer,
    rtt: RttEstimator,
    handshake: Handshake,
    paused: bool,
}

/// Reliable, ordered channel over an unreliable transport
pub struct ChannelEngine {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    state: Mutex<EngineState>,
    /// Keeps transmission order equal to sequence order
    send_lock: Mutex<()>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    capabilities: watch::Sender<Option<Capabilities>>,
    fatal: Mutex<Option<TunnelError>>,
    closed: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelEngine {
    /// Create an engine and the receiver of its events
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ChannelConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (capabilities, _) = watch::channel(None);

        let state = EngineState {
            next_outgoing_sequence_number: 0,
            incoming: IncomingBuffer::new(config.incoming_buffer_capacity),
            outgoing: OutgoingBuffer::new(config.outgoing_buffer_capacity),
            rtt: RttEstimator::new(
                config.initial_retransmission_timeout,
                config.resend_interval,
                config.max_retransmission_timeout,
            ),
            handshake: Handshake::new(),
            paused: false,
        };

        let engine = Arc::new(Self {
            transport,
            config,
            state: Mutex::new(state),
            send_lock: Mutex::new(()),
            events,
            capabilities,
            fatal: Mutex::new(None),
            closed: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        (engine, events_rx)
    }

    /// Engine configuration
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Start the receive loop and the resend scheduler
    pub async fn open(self: &Arc<Self>) {
        self.state.lock().await.handshake.start();

        let receiver = tokio::spawn(self.clone().run_receive_loop());
        let resender = tokio::spawn(scheduler::run_resend_scheduler(
            self.clone(),
            self.closed.child_token(),
        ));

        self.tasks.lock().await.extend([receiver, resender]);
        tracing::debug!("Channel opened");
    }

    /// Send one chunk of stream data
    ///
    /// Returns the assigned sequence number. If the transport send fails
    /// the envelope stays buffered and the resend scheduler retries it.
    pub async fn send(&self, payload_type: PayloadType, payload: Bytes) -> Result<i64, TunnelError> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::ChannelClosed("channel is closed".into()));
        }

        let _ordered = self.send_lock.lock().await;

        let (seq, raw, paused) = {
            let mut state = self.state.lock().await;
            let seq = state.next_outgoing_sequence_number;
            let flags = if seq == 0 { Flags::SYN } else { Flags::DATA };
            let raw = Envelope::new(MessageType::InputStreamData, seq, payload_type, payload)
                .with_flags(flags)
                .encode();

            let paused = state.paused;
            if let Err(e) = state.outgoing.insert(seq, raw.clone(), Instant::now(), !paused) {
                let capacity = state.outgoing.capacity();
                drop(state);
                tracing::error!("{}", e);
                self.terminate(TunnelError::OutgoingBufferOverflow { capacity })
                    .await;
                return Err(e);
            }
            state.next_outgoing_sequence_number += 1;
            (seq, raw, paused)
        };

        if paused {
            tracing::trace!("Publication paused, holding envelope {}", seq);
            return Ok(seq);
        }

        tracing::trace!("Sending envelope {} ({} bytes)", seq, raw.len());
        self.transport.send(raw).await?;
        Ok(seq)
    }

    /// Send a port control flag
    pub async fn send_flag(&self, flag: PortFlag) -> Result<i64, TunnelError> {
        tracing::debug!("Sending flag {:?}", flag);
        self.send(PayloadType::Flag, flag.encode()).await
    }

    /// Process one raw inbound envelope
    ///
    /// Malformed envelopes are dropped without an acknowledgement. Errors
    /// returned here are fatal to the channel.
    pub async fn on_receive(&self, raw: &[u8]) -> Result<(), TunnelError> {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping malformed envelope: {}", e);
                return Ok(());
            }
        };

        match envelope.message_type {
            MessageType::OutputStreamData | MessageType::InputStreamData => {
                self.on_stream_data(envelope).await
            }
            MessageType::Acknowledge => {
                self.on_acknowledge(&envelope).await;
                Ok(())
            }
            MessageType::ChannelClosed => {
                self.on_channel_closed(&envelope).await;
                Ok(())
            }
            MessageType::PausePublication => {
                tracing::debug!("Agent paused publication");
                self.state.lock().await.paused = true;
                Ok(())
            }
            MessageType::StartPublication => {
                tracing::debug!("Agent resumed publication");
                self.state.lock().await.paused = false;
                Ok(())
            }
        }
    }

    async fn on_stream_data(&self, envelope: Envelope) -> Result<(), TunnelError> {
        let seq = envelope.sequence_number;
        let ack = AcknowledgeContent::for_envelope(&envelope).to_envelope()?;
        let mut handshake_response = None;

        {
            let mut state = self.state.lock().await;
            match state.incoming.accept(envelope)? {
                Accepted::Deliver(ready) => {
                    for envelope in ready {
                        if let Some(response) = self.dispatch(&mut state, envelope) {
                            handshake_response = Some(response);
                        }
                    }
                }
                Accepted::Buffered => {
                    tracing::debug!(
                        "Buffered out-of-order envelope {} (expecting {})",
                        seq,
                        state.incoming.expected()
                    );
                }
                Accepted::Duplicate => {
                    tracing::debug!("Discarding duplicate envelope {}", seq);
                }
            }
        }

        // Duplicates are acknowledged too
        if let Err(e) = self.transport.send(ack.encode()).await {
            tracing::warn!("Failed to acknowledge envelope {}: {}", seq, e);
            if e.is_permanent() {
                return Err(e.into());
            }
        }

        if let Some(response) = handshake_response {
            self.send(PayloadType::HandshakeResponse, response).await?;
            self.state.lock().await.handshake.on_response_sent();
        }

        Ok(())
    }

    /// Hand one in-order envelope to its consumer
    ///
    /// Returns an encoded handshake response when one must be sent.
    fn dispatch(&self, state: &mut EngineState, envelope: Envelope) -> Option<Bytes> {
        let seq = envelope.sequence_number;
        match envelope.payload_kind() {
            Some(PayloadType::HandshakeRequest) => {
                let request: HandshakeRequestPayload = match decode_json(&envelope.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!("Invalid handshake request {}: {}", seq, e);
                        return None;
                    }
                };
                let response = state.handshake.on_request(&request, Instant::now());
                match encode_json(&response) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::error!("Failed to encode handshake response: {}", e);
                        None
                    }
                }
            }
            Some(PayloadType::HandshakeComplete) => {
                let complete: HandshakeCompletePayload =
                    decode_json(&envelope.payload).unwrap_or_default();
                let capabilities = state.handshake.on_complete(&complete, Instant::now());
                tracing::info!(
                    "Handshake complete with agent {}",
                    capabilities.agent_version
                );
                self.capabilities.send_replace(Some(capabilities));
                None
            }
            Some(PayloadType::EncChallengeRequest) => {
                tracing::warn!("Ignoring encryption challenge {}: encryption is not supported", seq);
                None
            }
            Some(payload_type) => {
                let _ = self.events.send(ChannelEvent::Output {
                    payload_type,
                    payload: envelope.payload,
                });
                None
            }
            None => {
                tracing::warn!(
                    "Discarding envelope {} with unknown payload type {}",
                    seq,
                    envelope.payload_type
                );
                None
            }
        }
    }

    async fn on_acknowledge(&self, envelope: &Envelope) {
        let ack = match AcknowledgeContent::from_envelope(envelope) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("Dropping malformed acknowledgement: {}", e);
                return;
            }
        };
        let seq = ack.acknowledged_message_sequence_number;

        let mut state = self.state.lock().await;
        match state.outgoing.acknowledge(seq) {
            Some(entry) => {
                // Only unambiguous round trips are sampled
                if entry.attempts == 1 {
                    let sample = Instant::now().saturating_duration_since(entry.first_sent);
                    state.rtt.update(sample);
                }
                tracing::trace!("Envelope {} acknowledged, rto {:?}", seq, state.rtt.rto());
            }
            None => tracing::debug!("Acknowledgement for unknown envelope {}", seq),
        }
    }

    async fn on_channel_closed(&self, envelope: &Envelope) {
        let closed: ChannelClosed = decode_json(&envelope.payload).unwrap_or_default();
        let reason = if closed.output.is_empty() {
            "closed by remote".to_string()
        } else {
            closed.output
        };
        tracing::info!("Session {} closed by agent: {}", closed.session_id, reason);
        self.shutdown(reason);
    }

    /// Retransmit every envelope whose timeout elapsed
    pub async fn resend_due(&self) -> Result<usize, TunnelError> {
        let due = {
            let mut state = self.state.lock().await;
            if state.paused {
                return Ok(0);
            }
            let rto = state.rtt.rto();
            state
                .outgoing
                .take_due(Instant::now(), rto, self.config.max_resend_attempts)?
        };

        let count = due.len();
        for raw in due {
            if let Err(e) = self.transport.send(raw).await {
                if e.is_permanent() {
                    return Err(e.into());
                }
                tracing::warn!("Retransmission failed: {}", e);
            }
        }
        if count > 0 {
            tracing::debug!("Retransmitted {} envelopes", count);
        }
        Ok(count)
    }

    async fn run_receive_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                frame = self.transport.recv() => match frame {
                    Some(Ok(raw)) => {
                        if let Err(e) = self.on_receive(&raw).await {
                            self.terminate(e).await;
                            break;
                        }
                    }
                    Some(Err(e)) if e.is_permanent() => {
                        self.terminate(e.into()).await;
                        break;
                    }
                    Some(Err(e)) => tracing::warn!("Transport receive error: {}", e),
                    None => {
                        if !self.closed.is_cancelled() {
                            self.terminate(TransportError::Closed.into()).await;
                        }
                        break;
                    }
                },
            }
        }
        tracing::debug!("Receive loop stopped");
    }

    /// Wait for the handshake to complete
    ///
    /// Fails with [`TunnelError::HandshakeTimeout`] if it does not complete
    /// within `timeout`, or [`TunnelError::ChannelClosed`] if the channel
    /// terminates first.
    pub async fn wait_for_handshake(&self, timeout: Duration) -> Result<Capabilities, TunnelError> {
        let mut rx = self.capabilities.subscribe();
        let wait = async {
            tokio::select! {
                result = rx.wait_for(Option::is_some) => result.ok().and_then(|c| c.clone()),
                _ = self.closed.cancelled() => None,
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(capabilities)) => Ok(capabilities),
            Ok(None) => Err(TunnelError::ChannelClosed(
                "closed during handshake".into(),
            )),
            Err(_) => Err(TunnelError::HandshakeTimeout(timeout)),
        }
    }

    /// Negotiated capabilities, if the handshake completed
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities.borrow().clone()
    }

    /// Current handshake state
    pub async fn handshake_state(&self) -> HandshakeState {
        self.state.lock().await.handshake.state()
    }

    /// Next inbound sequence number expected
    pub async fn expected_sequence_number(&self) -> i64 {
        self.state.lock().await.incoming.expected()
    }

    /// Sequence number the next `send` will use
    pub async fn next_outgoing_sequence_number(&self) -> i64 {
        self.state.lock().await.next_outgoing_sequence_number
    }

    /// Sequence numbers sent but not yet acknowledged
    pub async fn unacknowledged(&self) -> Vec<i64> {
        self.state.lock().await.outgoing.sequence_numbers()
    }

    /// Current retransmission timeout
    pub async fn retransmission_timeout(&self) -> Duration {
        self.state.lock().await.rtt.rto()
    }

    /// Whether the channel has terminated
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel terminates
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Take the error that terminated the channel, if any
    pub async fn take_error(&self) -> Option<TunnelError> {
        self.fatal.lock().await.take()
    }

    /// Terminate the channel because of a fatal error
    pub async fn terminate(&self, error: TunnelError) {
        if self.closed.is_cancelled() {
            return;
        }
        tracing::error!("Channel terminated: {}", error);
        let reason = error.to_string();
        let mut fatal = self.fatal.lock().await;
        if fatal.is_none() {
            *fatal = Some(error);
        }
        drop(fatal);
        self.shutdown(reason);
    }

    fn shutdown(&self, reason: String) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let _ = self.events.send(ChannelEvent::Closed { reason });
    }

    /// Close the channel and wait for its background tasks
    pub async fn close(&self) -> Result<(), TunnelError> {
        self.shutdown("closed locally".to_string());
        let result = self.transport.close().await;

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::debug!("Channel closed");
        result.map_err(TunnelError::from)
    }
}
