//! Output for the CLI
//!
//! Stdout carries the machine-readable status line, so human-facing
//! messages go to stderr.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Value of the status line's `type` field
pub const STATUS_TYPE: &str = "tunnelwire";

/// One-line JSON record written once the forward is listening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLine {
    #[serde(rename = "type")]
    pub kind: String,
    pub port: u16,
    pub pid: u32,
    pub status: String,
    pub timestamp: String,
    pub forwarding: String,
    pub bastion: String,
}

impl StatusLine {
    /// Status of an active forward in this process
    pub fn active(port: u16, forwarding: impl Into<String>, bastion: impl Into<String>) -> Self {
        Self {
            kind: STATUS_TYPE.to_string(),
            port,
            pid: std::process::id(),
            status: "active".to_string(),
            timestamp: tw_core::time::now_rfc3339(),
            forwarding: forwarding.into(),
            bastion: bastion.into(),
        }
    }
}

/// Write the status line to `path`, or to stdout when `None`
pub fn write_status(path: Option<&Path>, status: &StatusLine) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(status)?;
    line.push('\n');
    match path {
        Some(path) => std::fs::write(path, line)?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(line.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}

/// Print an error message with a red X
pub fn print_error(msg: &str) {
    print_marked(crossterm::style::Color::Red, "✗ ", msg);
}

/// Print an informational message with a cyan info symbol
pub fn print_info(msg: &str) {
    print_marked(crossterm::style::Color::Cyan, "ℹ ", msg);
}

fn print_marked(color: crossterm::style::Color, mark: &str, msg: &str) {
    use crossterm::style::{Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(color),
        Print(mark),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
