//! Control Surface: the external command channel the host application (or
//! the `rootbridge` CLI's `approve`/`status` subcommands) uses to drive the
//! daemon. Not a network socket — a local Unix domain socket carrying
//! line-delimited JSON requests/responses.
//!
//! Modeled on a thin handle into shared daemon state crossed with an admin
//! API's request/response shape, simplified to JSON-over-UDS since there is
//! no HTTP admin surface here.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::*;

use crate::daemon::Daemon;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Approve { kid: String },
    Status,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Status {
        tunnel_url: Option<String>,
        active_sessions: usize,
        last_fingerprint: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Runs the control socket's accept loop until the daemon is told to stop.
/// Each connection is handled to completion (one request, one response)
/// rather than kept open, matching a CLI subcommand dialing in once.
pub async fn serve(daemon: Arc<Daemon>, socket_path: &Path) -> Result<()> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "control surface listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(daemon, stream).await {
                warn!(error = %e, "control connection failed");
            }
        });
    }
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };
    let response = match serde_json::from_str::<ControlCommand>(&line) {
        Ok(command) => dispatch(&daemon, command).await,
        Err(e) => ControlResponse::Error {
            message: format!("malformed control request: {e}"),
        },
    };

    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    write_half.shutdown().await?;
    Ok(())
}

async fn dispatch(daemon: &Arc<Daemon>, command: ControlCommand) -> ControlResponse {
    match command {
        ControlCommand::Approve { kid } => match daemon.approve(&kid).await {
            Ok(()) => ControlResponse::Ok,
            Err(e) => ControlResponse::Error { message: e.to_string() },
        },
        ControlCommand::Status => {
            let status = daemon.status().await;
            ControlResponse::Status {
                tunnel_url: status.tunnel_url,
                active_sessions: status.active_sessions,
                last_fingerprint: status.last_fingerprint,
            }
        }
        ControlCommand::Stop => {
            daemon.stop().await;
            ControlResponse::Ok
        }
    }
}

/// Dials a running daemon's control socket, sends one command, and returns
/// its response. Used by the `rootbridge approve`/`status` subcommands.
pub async fn send_command(socket_path: &Path, command: ControlCommand) -> Result<ControlResponse> {
    let stream = UnixStream::connect(socket_path).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut payload = serde_json::to_vec(&command)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    write_half.shutdown().await?;

    let mut lines = BufReader::new(read_half).lines();
    let Some(line) = lines.next_line().await? else {
        return Err(crate::error::BridgeError::NotRunning);
    };
    Ok(serde_json::from_str(&line)?)
}
