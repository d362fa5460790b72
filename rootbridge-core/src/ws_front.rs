//! WebSocket Front: accepts upgrades from allow-listed origins, enforces
//! per-frame size limits, and dispatches parsed envelopes into the Session
//! State Machine.
//!
//! `ws.on_upgrade` splits the socket into a sink/stream pair, crossed with a
//! single-writer-task pattern so Hub-originated output and protocol replies
//! never interleave out of order on the wire.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::web::Data;
use poem::{handler, http::StatusCode, IntoResponse, Request, Response};
use tokio::sync::{mpsc, oneshot};
use tracing::*;
use uuid::Uuid;

use crate::daemon::Daemon;
use crate::hub::HubSink;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::rate_limit::MAX_FRAME_BYTES;
use crate::session::{Outbound, Session, AUTH_WINDOW, CHALLENGE_TTL};

/// Returns the `Origin` header's host, stripped of scheme and port. A
/// bracketed IPv6 literal (`[::1]:22000`) keeps its brackets so it compares
/// equal to the `"[::1]"` allow-list entry instead of being truncated at the
/// first `:` inside the brackets.
fn origin_host(origin: &str) -> Option<&str> {
    let without_scheme = origin.split("://").nth(1).unwrap_or(origin);
    if let Some(rest) = without_scheme.strip_prefix('[') {
        let end = rest.find(']')?;
        return Some(&without_scheme[..end + 2]);
    }
    let host = without_scheme.split(['/', ':']).next()?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Origin allow-list: loopback, the tunnel provider's quick-tunnel wildcard
/// domain, and an operator-configured custom host.
pub fn is_allowed_origin(origin: Option<&str>, custom_host: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return false;
    };
    let Some(host) = origin_host(origin) else {
        return false;
    };
    if host == "localhost" || host == "127.0.0.1" || host == "[::1]" {
        return true;
    }
    if host.ends_with(".trycloudflare.com") {
        return true;
    }
    if let Some(custom) = custom_host {
        if host == custom {
            return true;
        }
    }
    false
}

#[handler]
pub async fn websocket_handler(
    req: &Request,
    ws: WebSocket,
    daemon: Data<&Arc<Daemon>>,
) -> Response {
    let origin = req
        .header(poem::http::header::ORIGIN)
        .map(|v| v.to_owned());
    let remote_addr = req.remote_addr().to_string();

    if !is_allowed_origin(origin.as_deref(), daemon.custom_origin_host()) {
        warn!(?origin, %remote_addr, "rejected WebSocket origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let daemon = daemon.0.clone();
    ws.on_upgrade(move |socket| async move {
        run_session(daemon, socket, remote_addr, origin).await;
    })
    .into_response()
}

/// Sink implementation that turns Hub-delivered plaintext into an
/// AEAD-encrypted `e2e_output` frame on this connection's own outbound
/// channel. `deliver`/`close` are synchronous per the `HubSink` contract;
/// the actual socket write happens on the connection's single writer task.
struct WsHubSink {
    tx: mpsc::UnboundedSender<Message>,
    cipher: crate::crypto::SessionCipher,
}

impl HubSink for WsHubSink {
    fn deliver(&self, plaintext: &[u8]) {
        let Ok(frame) = self.cipher.encrypt(plaintext) else {
            warn!("failed to encrypt outbound PTY chunk for a session");
            return;
        };
        let msg = ServerMessage::from(frame);
        if let Ok(json) = serde_json::to_string(&msg) {
            let _ = self.tx.send(Message::Text(json));
        }
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Message::Close(Some((code, reason.to_owned()))));
    }
}

async fn run_session(
    daemon: Arc<Daemon>,
    socket: WebSocketStream,
    remote_addr: String,
    origin: Option<String>,
) {
    if daemon.connect_guard().check_upgrade().is_err() {
        warn!(%remote_addr, "rejected upgrade: connect rate limit exceeded");
        let (mut sink, _stream) = socket.split();
        let _ = sink
            .send(Message::Close(Some((1008, "Rate limit exceeded".to_owned()))))
            .await;
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    let (mut session, initial) = Session::new(daemon.keystore(), daemon.pending(), daemon.clone());
    let span = info_span!("session", id = %session.id, %remote_addr, origin = origin.as_deref().unwrap_or(""));
    let _enter = span.enter();
    info!("session upgraded");

    let mut pending_rx: Option<oneshot::Receiver<()>> = None;

    if !dispatch_outbound(initial, &daemon, &session, &tx, &mut pending_rx).await {
        let _ = writer.await;
        return;
    }

    let challenge_timer = tokio::time::sleep(CHALLENGE_TTL);
    tokio::pin!(challenge_timer);
    let auth_window_timer = tokio::time::sleep(AUTH_WINDOW);
    tokio::pin!(auth_window_timer);

    loop {
        tokio::select! {
            frame = stream.next() => {
                let Some(frame) = frame else { break };
                let Ok(frame) = frame else { break };
                match frame {
                    Message::Text(text) => {
                        if text.len() > MAX_FRAME_BYTES {
                            continue;
                        }
                        let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) else {
                            continue;
                        };
                        let outbound = session.handle_message(parsed).await;
                        if !dispatch_outbound(outbound, &daemon, &session, &tx, &mut pending_rx).await {
                            break;
                        }
                    }
                    Message::Binary(bytes) => {
                        if bytes.len() > MAX_FRAME_BYTES {
                            continue;
                        }
                        // Envelopes are JSON-only; a binary frame is dropped silently.
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = &mut challenge_timer, if session.is_awaiting_auth() => {
                let outbound = session.expire_challenge_if_stale();
                if !dispatch_outbound(outbound, &daemon, &session, &tx, &mut pending_rx).await {
                    break;
                }
            }
            _ = &mut auth_window_timer, if !session.is_streaming() && !session.is_closed() => {
                warn!("auth window expired before reaching streaming");
                let _ = tx.send(Message::Close(Some((1008, "authentication window expired".to_owned()))));
                break;
            }
            result = recv_approval(&mut pending_rx) => {
                if result.is_some() {
                    let outbound = session.on_approved();
                    if !dispatch_outbound(outbound, &daemon, &session, &tx, &mut pending_rx).await {
                        break;
                    }
                }
            }
        }

        if session.is_closed() {
            break;
        }
    }

    daemon.hub().detach(&session.id).await;
    drop(tx);
    let _ = writer.await;
    info!("session ended");
}

/// Awaits the pending-approval receiver if one is outstanding, otherwise
/// never resolves (so the `select!` branch is simply inert). The session
/// itself already remembers which kid it registered under.
async fn recv_approval(pending_rx: &mut Option<oneshot::Receiver<()>>) -> Option<()> {
    match pending_rx {
        Some(rx) => {
            let result = rx.await;
            *pending_rx = None;
            result.ok()
        }
        None => std::future::pending().await,
    }
}

/// Applies a batch of `Outbound` effects, returning `false` once the
/// connection should be torn down.
async fn dispatch_outbound(
    outbound: Vec<Outbound>,
    daemon: &Arc<Daemon>,
    session: &Session,
    tx: &mpsc::UnboundedSender<Message>,
    pending_rx: &mut Option<oneshot::Receiver<()>>,
) -> bool {
    for effect in outbound {
        match effect {
            Outbound::Send(msg) => {
                if let ServerMessage::E2eReady { ref fingerprint } = msg {
                    daemon.set_last_fingerprint(fingerprint.clone()).await;
                }
                if let Ok(json) = serde_json::to_string(&msg) {
                    if tx.send(Message::Text(json)).is_err() {
                        return false;
                    }
                }
            }
            Outbound::WaitForApproval(rx) => {
                *pending_rx = Some(rx);
            }
            Outbound::EnterStreaming => {
                if let Some(cipher) = session.cipher() {
                    let sink = Arc::new(WsHubSink { tx: tx.clone(), cipher });
                    daemon.hub().attach(session.id, sink).await;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = tx.send(Message::Close(Some((code, reason))));
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_origins_are_allowed() {
        assert!(is_allowed_origin(Some("http://localhost:22000"), None));
        assert!(is_allowed_origin(Some("http://127.0.0.1:22000"), None));
    }

    #[test]
    fn bracketed_ipv6_loopback_origin_is_allowed() {
        assert!(is_allowed_origin(Some("http://[::1]:22000"), None));
        assert_eq!(origin_host("http://[::1]:22000"), Some("[::1]"));
    }

    #[test]
    fn quick_tunnel_wildcard_is_allowed() {
        assert!(is_allowed_origin(Some("https://random-words.trycloudflare.com"), None));
    }

    #[test]
    fn custom_origin_host_is_allowed_when_configured() {
        assert!(is_allowed_origin(
            Some("https://my-box.example.com"),
            Some("my-box.example.com")
        ));
    }

    #[test]
    fn unrelated_origins_are_rejected() {
        assert!(!is_allowed_origin(Some("https://evil.example.com"), None));
        assert!(!is_allowed_origin(None, None));
    }

    #[test]
    fn origin_host_strips_scheme_and_port() {
        assert_eq!(origin_host("https://example.com:443/path"), Some("example.com"));
        assert_eq!(origin_host("http://localhost:22000"), Some("localhost"));
    }
}
