//! Tunnel subprocess lifecycle: out of scope as a program, but the daemon
//! spawns it and parses its announced public URL. A child process owning
//! and watching its stdout, simplified here to a line-oriented scan rather
//! than a full PTY.

use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::*;

use crate::config::{TunnelConfig, TunnelMode};
use crate::error::{BridgeError, Result};

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\S*").expect("valid regex"));

/// A spawned tunnel subprocess. Dropping this does not kill the child;
/// callers hold it alongside a `Daemon` and call `shutdown` explicitly on
/// `stop()`, matching `PtySupervisor`'s ownership shape.
pub struct TunnelProcess {
    child: Child,
}

impl TunnelProcess {
    /// Spawns the configured tunnel binary and returns both the process
    /// handle and a channel that yields the first `https://` URL observed
    /// on its stdout/stderr (the `tunnel_live` event payload).
    pub fn spawn(config: &TunnelConfig, local_addr: &str) -> Result<(Self, mpsc::Receiver<String>)> {
        let mut cmd = Command::new(&config.binary);
        match config.mode {
            TunnelMode::Quick => {
                cmd.arg("--url").arg(format!("http://{local_addr}"));
            }
            TunnelMode::Named => {
                let token = config
                    .token
                    .as_ref()
                    .ok_or_else(|| BridgeError::Config("named tunnel mode requires a token".into()))?;
                cmd.arg("run").arg("--token").arg(token);
            }
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(BridgeError::Io)?;
        let (tx, rx) = mpsc::channel(1);

        if let Some(stdout) = child.stdout.take() {
            spawn_scanner(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_scanner(stderr, tx);
        }

        Ok((Self { child }, rx))
    }

    pub async fn shutdown(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

fn spawn_scanner(stream: impl tokio::io::AsyncRead + Unpin + Send + 'static, tx: mpsc::Sender<String>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(url) = extract_url(&line) {
                        debug!(%url, "tunnel announced public URL");
                        if tx.send(url).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "tunnel output scan failed");
                    break;
                }
            }
        }
    });
}

fn extract_url(line: &str) -> Option<String> {
    URL_PATTERN.find(line).map(|m| m.as_str().trim_end_matches(['.', ',']).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_https_url_from_a_line() {
        let line = "2024-01-01T00:00:00Z INF |  https://random-words.trycloudflare.com  ";
        assert_eq!(
            extract_url(line),
            Some("https://random-words.trycloudflare.com".to_owned())
        );
    }

    #[test]
    fn ignores_lines_without_a_url() {
        assert_eq!(extract_url("connecting to edge..."), None);
    }

    #[test]
    fn trims_trailing_punctuation() {
        assert_eq!(
            extract_url("see https://foo.example.com."),
            Some("https://foo.example.com".to_owned())
        );
    }
}
