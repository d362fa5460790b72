//! The daemon itself: owns every long-lived collaborator — key store,
//! pending-approval queue, broadcast hub, rate guard, the lazily spawned
//! PTY, and the optional tunnel subprocess — and wires the HTTP/WS front
//! door and Control Surface on top of them.
//!
//! One struct holding every shared collaborator behind its own lock, handed
//! around as an `Arc`, wiring a `poem::Route`, applying `SetHeader`, and
//! calling `Server::new(...).run(app)`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use poem::http::header;
use poem::listener::TcpListener;
use poem::middleware::SetHeader;
use poem::web::Data;
use poem::{get, EndpointExt, Route, Server};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::*;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::hub::Hub;
use crate::keystore::KeyStore;
use crate::pending::PendingApprovals;
use crate::pty::PtySupervisor;
use crate::rate_limit::ConnectGuard;
use crate::session::{PtyProvider, PtyWriter};
use crate::tunnel::TunnelProcess;

/// Snapshot returned to the Control Surface's `status` command.
pub struct DaemonStatus {
    pub tunnel_url: Option<String>,
    pub active_sessions: usize,
    pub last_fingerprint: Option<String>,
}

/// The daemon's shared state, handed to both the WebSocket front door and
/// the Control Surface as a single `Arc<Daemon>`.
pub struct Daemon {
    config: BridgeConfig,
    keystore: Arc<KeyStore>,
    pending: Arc<PendingApprovals>,
    hub: Arc<Hub>,
    connect_guard: ConnectGuard,
    pty: RwLock<Option<Arc<PtySupervisor>>>,
    tunnel: Mutex<Option<TunnelProcess>>,
    tunnel_url: RwLock<Option<String>>,
    last_fingerprint: RwLock<Option<String>>,
}

impl Daemon {
    pub async fn new(config: BridgeConfig) -> Result<Arc<Self>> {
        let keystore = Arc::new(KeyStore::load(&config.approved_identities_file).await?);
        Ok(Arc::new(Self {
            config,
            keystore,
            pending: Arc::new(PendingApprovals::new()),
            hub: Arc::new(Hub::new()),
            connect_guard: ConnectGuard::new(),
            pty: RwLock::new(None),
            tunnel: Mutex::new(None),
            tunnel_url: RwLock::new(None),
            last_fingerprint: RwLock::new(None),
        }))
    }

    pub fn keystore(&self) -> Arc<KeyStore> {
        self.keystore.clone()
    }

    pub fn pending(&self) -> Arc<PendingApprovals> {
        self.pending.clone()
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn connect_guard(&self) -> &ConnectGuard {
        &self.connect_guard
    }

    pub fn custom_origin_host(&self) -> Option<&str> {
        self.config.custom_origin_host.as_deref()
    }

    pub async fn set_last_fingerprint(&self, fingerprint: String) {
        *self.last_fingerprint.write().await = Some(fingerprint);
    }

    /// Approves a queued first-time pairing: pins the key, then wakes every
    /// session waiting on that kid.
    pub async fn approve(&self, kid: &str) -> Result<()> {
        let Some((jwk, waiters)) = self.pending.take(kid) else {
            return Err(BridgeError::UnknownPendingIdentity(kid.to_owned()));
        };
        self.keystore.insert(kid.to_owned(), jwk).await?;
        for waiter in waiters {
            let _ = waiter.send(());
        }
        Ok(())
    }

    pub async fn status(&self) -> DaemonStatus {
        DaemonStatus {
            tunnel_url: self.tunnel_url.read().await.clone(),
            active_sessions: self.hub.connection_count().await,
            last_fingerprint: self.last_fingerprint.read().await.clone(),
        }
    }

    /// Tears down every live connection and owned process, then exits the
    /// process once the Control Surface has had a chance to flush its
    /// response — there is no in-process caller left to hand control back
    /// to once the daemon's collaborators are gone.
    pub async fn stop(&self) {
        info!("daemon stop requested via control surface");
        self.hub.close_all(1001, "daemon stopping").await;
        self.hub.clear_replay_buffer().await;
        if let Some(pty) = self.pty.write().await.take() {
            pty.shutdown().await;
        }
        if let Some(tunnel) = self.tunnel.lock().await.take() {
            tunnel.shutdown().await;
        }
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::process::exit(0);
        });
    }

    /// Starts the tunnel subprocess (if configured), the Control Surface's
    /// Unix socket listener, and the HTTP/WebSocket front door, and runs the
    /// latter to completion.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.config.tunnel.enabled {
            match TunnelProcess::spawn(&self.config.tunnel, &self.config.listen.to_string()) {
                Ok((process, mut url_rx)) => {
                    *self.tunnel.lock().await = Some(process);
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        if let Some(url) = url_rx.recv().await {
                            info!(%url, "tunnel is live");
                            *daemon.tunnel_url.write().await = Some(url);
                        }
                    });
                }
                Err(e) => warn!(error = %e, "failed to spawn tunnel subprocess"),
            }
        }

        let control_daemon = self.clone();
        let control_socket = self.config.control_socket.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::control::serve(control_daemon, &control_socket).await {
                error!(error = %e, "control surface stopped");
            }
        });

        self.run_front_door().await
    }

    async fn run_front_door(self: Arc<Self>) -> Result<()> {
        let assets_root: PathBuf = self.config.assets_root.clone();
        let address: SocketAddr = self.config.listen;

        // The WebSocket upgrade lives at "/" on the same socket the PWA
        // bundle is served from; the bundle's own assets live under other
        // paths, so "/*path" takes everything but root.
        let app = Route::new()
            .at("/", get(crate::ws_front::websocket_handler))
            .at("/*path", get(crate::assets::serve_asset))
            .with(
                SetHeader::new()
                    .overriding(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
                    .overriding(header::X_FRAME_OPTIONS, "DENY")
                    .overriding(header::REFERRER_POLICY, "strict-origin-when-cross-origin")
                    .overriding(
                        header::CONTENT_SECURITY_POLICY,
                        "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; connect-src 'self' ws: wss:",
                    ),
            )
            .data(self.clone())
            .data(assets_root);

        info!(%address, "listening");
        Server::new(TcpListener::bind(address))
            .run(app)
            .await
            .map_err(BridgeError::Io)
    }
}

#[async_trait]
impl PtyProvider for Daemon {
    /// Lazily spawns the daemon-wide PTY on the first connection to reach
    /// `streaming`, wiring its sanitized output straight into the Broadcast
    /// Hub.
    async fn ensure_pty(&self) -> Result<Arc<dyn PtyWriter>> {
        let mut guard = self.pty.write().await;
        if let Some(pty) = guard.as_ref() {
            return Ok(pty.clone() as Arc<dyn PtyWriter>);
        }

        let (output_tx, mut output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let supervisor = Arc::new(PtySupervisor::spawn(output_tx, crate::sanitizer::sanitize)?);
        *guard = Some(supervisor.clone());

        let hub = self.hub.clone();
        tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                hub.publish(&chunk).await;
            }
        });

        Ok(supervisor as Arc<dyn PtyWriter>)
    }
}
