//! tunnelwire CLI
//!
//! SSH-style local port forwarding over an already negotiated remote
//! session: `tunnelwire -L 8080:db.internal:5432 --session @session.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnelwire::commands::{forward_command, ForwardOptions};
use tunnelwire::forward::ForwardSpec;
use tunnelwire::output::{print_error, print_info};
use tw_core::config::default_config_path;
use tw_core::{ConfigFile, SessionInfo};

#[derive(Parser)]
#[command(name = "tunnelwire")]
#[command(author, version, about = "SSH-style port forwarding over remote session channels")]
struct Cli {
    /// Port forward: localPort:[remoteHost:]remotePort (local port 0 picks a free port)
    #[arg(short = 'L', long = "local-forward", value_name = "SPEC")]
    local_forward: Option<String>,

    /// Port forward, same as -L
    #[arg(value_name = "SPEC", conflicts_with = "local_forward")]
    spec: Option<String>,

    /// Session document as JSON, or @path to read it from a file
    #[arg(short, long, env = "TUNNELWIRE_SESSION", hide_env_values = true)]
    session: Option<String>,

    /// Target the session runs on (reported as "bastion")
    #[arg(short, long)]
    target: Option<String>,

    /// Wait until the local port accepts connections before reporting it
    #[arg(short, long)]
    wait: bool,

    /// How long to wait for the forward to come up (e.g. 30s, 500ms, 2m)
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    timeout: Duration,

    /// Write the status line to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let spec: ForwardSpec = cli
        .local_forward
        .or(cli.spec)
        .context("a port forward is required: -L localPort:[remoteHost:]remotePort")?
        .parse()?;

    let session_json = read_session(
        cli.session
            .as_deref()
            .context("a session is required: --session <json|@file>")?,
    )?;

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = ConfigFile::load_or_default(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;

    let target = match cli.target {
        Some(target) => target,
        None => SessionInfo::from_json(&session_json)
            .context("failed to read session")?
            .session_id,
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received interrupt signal, shutting down...");
                cancel.cancel();
            }
        }
    });

    if !cli.quiet {
        print_info(&format!("Forwarding {} via {}", spec, target));
    }

    let options = ForwardOptions {
        spec,
        session_json,
        target,
        wait: cli.wait,
        timeout: cli.timeout,
        output: cli.output,
    };
    forward_command(options, config, cancel).await
}

/// Inline JSON, or the contents of the file after `@`
fn read_session(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read session file {}", path)),
        None => Ok(arg.to_string()),
    }
}

/// Parse `30s`, `500ms`, `2m` or a bare number of seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {}", s))?;
    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit in {}", s)),
    }
}
