//! Retransmission scheduler
//!
//! Ticks at the configured resend interval and retransmits every envelope
//! whose retransmission timeout elapsed. Running out of attempts for any
//! envelope terminates the channel.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::ChannelEngine;

/// Run the resend loop until `cancel` fires or the channel fails
pub async fn run_resend_scheduler(engine: Arc<ChannelEngine>, cancel: CancellationToken) {
    let period = engine.config().resend_interval;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!("Starting resend scheduler (interval: {:?})", period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = engine.resend_due().await {
                    engine.terminate(e).await;
                    break;
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Resend scheduler shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use tw_core::{ChannelConfig, MemoryTransport, TunnelError};
    use tw_protocol::payload::AcknowledgeContent;
    use tw_protocol::{Envelope, PayloadType};

    /// Engine whose outbound frames are captured instead of delivered
    async fn lossy_engine(
        config: ChannelConfig,
    ) -> (Arc<ChannelEngine>, Arc<Mutex<Vec<Bytes>>>, MemoryTransport) {
        let (client, agent) = MemoryTransport::pair();
        let captured = Arc::new(Mutex::new(Vec::new()));
        {
            let captured = captured.clone();
            client
                .set_outbound_hook(move |frame| {
                    captured.lock().unwrap().push(frame);
                    vec![]
                })
                .await;
        }
        let (engine, _events) = ChannelEngine::new(Arc::new(client), config);
        engine.open().await;
        (engine, captured, agent)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_envelope_is_resent() {
        let config = ChannelConfig::default();
        let interval = config.resend_interval;
        let (engine, captured, _agent) = lossy_engine(config).await;

        engine.send(PayloadType::Output, Bytes::from("lost")).await.unwrap();
        tokio::time::sleep(interval * 3).await;

        // First transmission plus at least two retransmissions within three
        // resend intervals
        let sent = captured.lock().unwrap().clone();
        assert!(sent.len() >= 3, "only {} transmissions", sent.len());
        assert!(sent.iter().all(|raw| raw == &sent[0]));

        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_envelope_is_not_resent() {
        let config = ChannelConfig::default();
        let interval = config.resend_interval;
        let (engine, captured, _agent) = lossy_engine(config).await;

        engine.send(PayloadType::Output, Bytes::from("ok")).await.unwrap();
        let raw = captured.lock().unwrap()[0].clone();
        let sent = Envelope::decode(&raw).unwrap();
        let ack = AcknowledgeContent::for_envelope(&sent).to_envelope().unwrap();
        engine.on_receive(&ack.encode()).await.unwrap();

        tokio::time::sleep(interval * 5).await;
        assert_eq!(captured.lock().unwrap().len(), 1);
        assert!(engine.unacknowledged().await.is_empty());

        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_terminate_channel() {
        let config = ChannelConfig {
            max_resend_attempts: 3,
            ..Default::default()
        };
        let (engine, _captured, _agent) = lossy_engine(config).await;

        engine.send(PayloadType::Output, Bytes::from("void")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), engine.closed())
            .await
            .unwrap();

        assert!(matches!(
            engine.take_error().await,
            Some(TunnelError::ResendTimeout {
                sequence_number: 0,
                attempts: 3
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_stops_on_cancel() {
        let (client, _agent) = MemoryTransport::pair();
        let (engine, _events) = ChannelEngine::new(Arc::new(client), ChannelConfig::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_resend_scheduler(engine, cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
    }
}
