//! Forward command
//!
//! Starts the session, waits for the local listener, reports it on the
//! status line and then keeps forwarding until cancelled or the session
//! ends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tw_core::{
    ConfigFile, LocalEndpoint, SessionInfo, SessionNegotiator, StartSessionRequest,
    StaticNegotiator, Transport, TunnelError,
};
use tw_session::Session;

use crate::forward::ForwardSpec;
use crate::output::{write_status, StatusLine};
use crate::ready::wait_for_port;
use crate::websocket::WebSocketTransport;

/// Options for one forward
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub spec: ForwardSpec,
    /// `{SessionId, TokenValue, StreamUrl}` document
    pub session_json: String,
    /// Target the session runs on, reported as `bastion`
    pub target: String,
    /// Poll-connect the listener before reporting it
    pub wait: bool,
    pub timeout: Duration,
    /// Status line destination, stdout when `None`
    pub output: Option<PathBuf>,
}

/// Negotiate the session, connect its WebSocket and forward
pub async fn forward_command(
    options: ForwardOptions,
    config: ConfigFile,
    cancel: CancellationToken,
) -> Result<()> {
    let negotiator =
        StaticNegotiator::from_json(&options.session_json).context("failed to read session")?;
    let request = StartSessionRequest::port_forwarding(&options.target, &options.spec.to_parameters());
    let info = negotiator
        .start_session(request)
        .await
        .context("failed to start session")?;

    let client_id = Uuid::new_v4().to_string();
    let transport = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        transport = WebSocketTransport::connect(&info, &client_id) => {
            transport.context("failed to connect to the session stream")?
        }
    };

    run_forward(&options, info, client_id, Arc::new(transport), config, cancel).await
}

/// Forward over an already open transport
pub async fn run_forward(
    options: &ForwardOptions,
    info: SessionInfo,
    client_id: String,
    transport: Arc<dyn Transport>,
    config: ConfigFile,
    cancel: CancellationToken,
) -> Result<()> {
    let session = Session::new(info, options.target.clone(), transport, config).with_client_id(client_id);
    let mut listening = session.listening();
    let mut task = tokio::spawn(session.run(options.spec.to_parameters(), cancel.clone()));

    let endpoint = tokio::select! {
        endpoint = wait_for_endpoint(&mut listening) => endpoint,
        _ = tokio::time::sleep(options.timeout) => {
            return abort(cancel, task, anyhow!("timeout after {:?}", options.timeout)).await;
        }
    };
    // The session ended without ever listening
    let Some(endpoint) = endpoint else {
        return finished(task.await);
    };

    let Some(port) = endpoint.port() else {
        return abort(cancel, task, anyhow!("listener {} is not a TCP port", endpoint)).await;
    };
    tracing::info!("Listening on {}", endpoint);

    if options.wait {
        let ready = tokio::select! {
            ready = wait_for_port(port, options.timeout) => ready,
            joined = &mut task => return finished(joined),
        };
        if let Err(e) = ready {
            return abort(cancel, task, e).await;
        }
    }

    let status = StatusLine::active(port, options.spec.forwarding(port), options.target.clone());
    if let Err(e) = write_status(options.output.as_deref(), &status) {
        return abort(cancel, task, e.context("failed to write output")).await;
    }

    finished(task.await)
}

async fn wait_for_endpoint(
    listening: &mut watch::Receiver<Option<LocalEndpoint>>,
) -> Option<LocalEndpoint> {
    let endpoint = listening.wait_for(Option::is_some).await.ok()?;
    endpoint.clone()
}

/// Stop the session and report why it never got established
async fn abort(
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), TunnelError>>,
    reason: anyhow::Error,
) -> Result<()> {
    cancel.cancel();
    let _ = task.await;
    Err(reason.context("port forward failed to establish"))
}

fn finished(joined: Result<Result<(), TunnelError>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.context("session error"),
        Err(e) => Err(anyhow!("session task failed: {}", e)),
    }
}
