//! Session State Machine: one instance per WebSocket connection, driving it
//! from the initial challenge through TOFU authentication, ephemeral ECDH,
//! and into streaming.
//!
//! Message handling is a pure-ish reducer (`handle_message` takes a parsed
//! `ClientMessage`, returns the `Outbound` effects to perform) so the state
//! machine can be driven in tests through a fake `PtyWriter`/`PtyProvider`
//! instead of a real socket and PTY, injecting a trait at the transport
//! seam instead of spinning up real I/O in unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::crypto::{
    compute_kid, derive_fingerprint, random_salt, verify_challenge_signature, EncryptedFrame,
    EphemeralKex, Jwk, SessionCipher,
};
use crate::error::Result;
use crate::keystore::KeyStore;
use crate::pending::PendingApprovals;
use crate::protocol::ServerMessage;
use crate::rate_limit::{clamp_resize, truncate_input, AuthAttempts};

/// Tolerance for decryption failures on an otherwise-live streaming
/// connection, chosen to match `rate_limit::MAX_AUTH_ATTEMPTS` for symmetry:
/// repeated failures should trigger a close without a separately-tuned
/// threshold.
const MAX_AEAD_FAILURES: u32 = 3;
const CHALLENGE_LEN: usize = 32;
/// Challenge validity: 32 random bytes, valid for 30s from issuance.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(30);
/// Auth window: a connection must reach `streaming` within 60s of upgrade or
/// the caller closes it with 1008.
pub const AUTH_WINDOW: Duration = Duration::from_secs(60);

/// A connection's single PTY handle, injected so `Session` never spawns or
/// owns a PTY directly. Implemented by `pty::PtySupervisor`.
pub trait PtyWriter: Send + Sync {
    fn write(&self, data: &[u8]);
    fn resize(&self, cols: u16, rows: u16);
}

impl PtyWriter for crate::pty::PtySupervisor {
    fn write(&self, data: &[u8]) {
        crate::pty::PtySupervisor::write(self, data)
    }

    fn resize(&self, cols: u16, rows: u16) {
        crate::pty::PtySupervisor::resize(self, cols, rows)
    }
}

/// Lazily provisions the daemon-wide PTY the first time any connection
/// reaches `streaming`: the PTY exists iff at least one connection has
/// entered streaming. Implemented by `daemon::Daemon`.
#[async_trait]
pub trait PtyProvider: Send + Sync {
    async fn ensure_pty(&self) -> Result<Arc<dyn PtyWriter>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    AwaitingAuth,
    PendingApproval,
    AwaitingClientEcdh,
    Streaming,
    Closed,
}

/// Effects a caller must perform after driving the state machine. `Session`
/// never touches a socket directly; the caller's read/write loop does.
pub enum Outbound {
    Send(ServerMessage),
    /// First-time pairing: the caller must wait on this receiver (alongside
    /// further inbound frames) and call `Session::on_approved` when it
    /// fires, or treat the connection as rejected if it is dropped.
    WaitForApproval(oneshot::Receiver<()>),
    /// The session has entered `streaming`; the caller should register it
    /// with the Broadcast Hub as a `HubSink`.
    EnterStreaming,
    Close { code: u16, reason: String },
}

pub struct Session {
    pub id: Uuid,
    keystore: Arc<KeyStore>,
    pending: Arc<PendingApprovals>,
    pty_provider: Arc<dyn PtyProvider>,
    state: SessionState,
    challenge: Vec<u8>,
    challenge_issued_at: Instant,
    auth_attempts: AuthAttempts,
    aead_failures: AtomicU32,
    kid: Option<String>,
    kex: Option<EphemeralKex>,
    salt: Option<[u8; 16]>,
    cipher: Option<SessionCipher>,
    pty: Option<Arc<dyn PtyWriter>>,
}

impl Session {
    /// Builds a fresh session and returns the initial `auth_challenge` the
    /// caller must send.
    pub fn new(
        keystore: Arc<KeyStore>,
        pending: Arc<PendingApprovals>,
        pty_provider: Arc<dyn PtyProvider>,
    ) -> (Self, Vec<Outbound>) {
        let challenge = generate_challenge();
        let session = Self {
            id: Uuid::new_v4(),
            keystore,
            pending,
            pty_provider,
            state: SessionState::AwaitingAuth,
            challenge: challenge.clone(),
            challenge_issued_at: Instant::now(),
            auth_attempts: AuthAttempts::new(),
            aead_failures: AtomicU32::new(0),
            kid: None,
            kex: None,
            salt: None,
            cipher: None,
            pty: None,
        };
        let outbound = vec![Outbound::Send(ServerMessage::AuthChallenge {
            data: hex::encode(&challenge),
        })];
        (session, outbound)
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// True only while the challenge issued in `new` is still outstanding.
    /// Once a connection advances past `AwaitingAuth` (including into
    /// `PendingApproval`, which can legitimately sit for a long time waiting
    /// on a human `approve(kid)`) the challenge timer must no longer be
    /// selected, or an elapsed one-shot `Sleep` makes its `select!` branch
    /// permanently ready.
    pub fn is_awaiting_auth(&self) -> bool {
        self.state == SessionState::AwaitingAuth
    }

    /// Returns an independent clone of this session's AEAD cipher once
    /// streaming has begun, so the caller can build a `HubSink` that
    /// encrypts outbound PTY output without borrowing the `Session` itself.
    pub fn cipher(&self) -> Option<SessionCipher> {
        self.cipher.clone()
    }

    /// The connection's current `(kid, state-name)` for logging/status, not
    /// part of the wire protocol.
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Proactively closes a connection whose challenge has aged past
    /// `CHALLENGE_TTL` without a valid `auth_response`, for callers driving
    /// a timer independent of inbound messages.
    pub fn expire_challenge_if_stale(&mut self) -> Vec<Outbound> {
        if self.state == SessionState::AwaitingAuth && self.challenge_issued_at.elapsed() > CHALLENGE_TTL {
            self.state = SessionState::Closed;
            return vec![Outbound::Close {
                code: 1008,
                reason: "authentication challenge expired".to_owned(),
            }];
        }
        Vec::new()
    }

    /// Dispatches one parsed client message. Messages that don't fit the
    /// current state (including anything `ClientMessage::Unknown`) are
    /// ignored without a state change.
    pub async fn handle_message(&mut self, msg: crate::protocol::ClientMessage) -> Vec<Outbound> {
        use crate::protocol::ClientMessage as C;
        match (&self.state, msg) {
            (SessionState::AwaitingAuth, C::AuthResponse { key_id, signature, jwk }) => {
                self.handle_auth_response(key_id, signature, jwk).await
            }
            (SessionState::AwaitingClientEcdh, C::E2eClientKey { public_key }) => {
                self.handle_client_key(public_key).await
            }
            (SessionState::Streaming, C::E2eInput { iv, data, tag }) => {
                self.handle_input(iv, data, tag)
            }
            (SessionState::Streaming, C::Resize { cols, rows }) => self.handle_resize(cols, rows),
            _ => Vec::new(),
        }
    }

    /// Called once the Control Surface approves a first-time pairing and
    /// `PendingApprovals::take` has woken this session's waiter. The kid is
    /// already on `self.kid`, stashed when the pairing was queued.
    pub fn on_approved(&mut self) -> Vec<Outbound> {
        if self.state != SessionState::PendingApproval {
            return Vec::new();
        }
        self.state = SessionState::AwaitingClientEcdh;
        vec![
            Outbound::Send(ServerMessage::Registered),
            Outbound::Send(ServerMessage::AuthSuccess),
            self.begin_ecdh(),
        ]
    }

    async fn handle_auth_response(
        &mut self,
        key_id: String,
        signature: String,
        jwk: Option<Jwk>,
    ) -> Vec<Outbound> {
        if self.challenge_issued_at.elapsed() > CHALLENGE_TTL {
            self.state = SessionState::Closed;
            return vec![Outbound::Close {
                code: 1008,
                reason: "authentication challenge expired".to_owned(),
            }];
        }

        // TOFU: a known kid is always verified against the *stored* key,
        // never a client-supplied one, even if the client sends a jwk.
        if let Some(stored) = self.keystore.lookup(&key_id).await {
            return match verify_challenge_signature(&stored, &self.challenge, &signature) {
                Ok(()) => {
                    self.kid = Some(key_id);
                    self.state = SessionState::AwaitingClientEcdh;
                    vec![Outbound::Send(ServerMessage::AuthSuccess), self.begin_ecdh()]
                }
                Err(_) => self.on_bad_signature(),
            };
        }

        // Unknown kid, no jwk: a drop, not a failed attempt. There is
        // nothing to verify yet, so it doesn't touch the attempt cap or get
        // a response.
        let Some(jwk) = jwk else {
            return Vec::new();
        };
        // A jwk that doesn't even hash to the claimed kid is likewise
        // ignored without counting as a failed attempt.
        if compute_kid(&jwk) != key_id {
            return Vec::new();
        }
        // The kid and jwk match, so this is a real first-time pairing
        // attempt; require proof of possession before even queueing it for
        // approval. The literal transition table doesn't demand this
        // pre-approval, but admitting an unverified key into the approval
        // queue is a weaker posture than this daemon should take, so a bad
        // signature here is treated the same as a bad signature against a
        // known kid (counts toward the attempt cap).
        if verify_challenge_signature(&jwk, &self.challenge, &signature).is_err() {
            return self.on_bad_signature();
        }

        self.kid = Some(key_id.clone());
        let rx = self.pending.register(key_id, jwk);
        self.state = SessionState::PendingApproval;
        vec![Outbound::WaitForApproval(rx)]
    }

    fn on_bad_signature(&mut self) -> Vec<Outbound> {
        match self.auth_attempts.record_failure() {
            Ok(()) => vec![Outbound::Send(ServerMessage::AuthError {
                message: "authentication failed".to_owned(),
            })],
            Err(_) => {
                self.state = SessionState::Closed;
                vec![Outbound::Close {
                    code: 1008,
                    reason: "too many authentication attempts".to_owned(),
                }]
            }
        }
    }

    fn begin_ecdh(&mut self) -> Outbound {
        let kex = EphemeralKex::generate();
        let public_key = kex.public_key_bytes();
        let salt = random_salt();
        self.salt = Some(salt);
        self.kex = Some(kex);
        Outbound::Send(ServerMessage::E2eInit {
            public_key: STANDARD.encode(public_key),
            salt: STANDARD.encode(salt),
        })
    }

    async fn handle_client_key(&mut self, public_key_b64: String) -> Vec<Outbound> {
        let Some(kex) = self.kex.take() else {
            return Vec::new();
        };
        let salt = self.salt.expect("salt is set alongside kex in begin_ecdh");

        let Ok(peer_bytes) = STANDARD.decode(&public_key_b64) else {
            self.state = SessionState::Closed;
            return vec![Outbound::Close {
                code: 1008,
                reason: "invalid client public key".to_owned(),
            }];
        };
        let (Ok(session_key), Ok(shared)) = (
            kex.derive_session_key(&peer_bytes, &salt),
            kex.shared_secret(&peer_bytes),
        ) else {
            self.state = SessionState::Closed;
            return vec![Outbound::Close {
                code: 1008,
                reason: "key agreement failed".to_owned(),
            }];
        };

        let fingerprint = derive_fingerprint(&shared, &salt);
        self.cipher = Some(SessionCipher::new(&session_key));

        match self.pty_provider.ensure_pty().await {
            Ok(pty) => {
                self.pty = Some(pty);
                self.state = SessionState::Streaming;
                vec![
                    Outbound::Send(ServerMessage::E2eReady { fingerprint }),
                    Outbound::EnterStreaming,
                ]
            }
            Err(_) => {
                self.state = SessionState::Closed;
                vec![Outbound::Close {
                    code: 1011,
                    reason: "failed to provision shell".to_owned(),
                }]
            }
        }
    }

    fn handle_input(&mut self, iv: String, data: String, tag: String) -> Vec<Outbound> {
        let Some(cipher) = &self.cipher else {
            return Vec::new();
        };
        let frame = EncryptedFrame { iv, data, tag };
        match cipher.decrypt(&frame) {
            Ok(plaintext) => {
                self.aead_failures.store(0, Ordering::SeqCst);
                if let Some(pty) = &self.pty {
                    pty.write(truncate_input(&plaintext));
                }
                Vec::new()
            }
            Err(_) => {
                let failures = self.aead_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures > MAX_AEAD_FAILURES {
                    self.state = SessionState::Closed;
                    vec![Outbound::Close {
                        code: 1008,
                        reason: "repeated decryption failures".to_owned(),
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn handle_resize(&mut self, cols: i64, rows: i64) -> Vec<Outbound> {
        if let (Some((c, r)), Some(pty)) = (clamp_resize(cols, rows), &self.pty) {
            pty.resize(c, r);
        }
        Vec::new()
    }
}

fn generate_challenge() -> Vec<u8> {
    let mut bytes = vec![0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientMessage;
    use rsa::pss::SigningKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use sha2::Sha256;
    use std::sync::Mutex;

    struct MockPty {
        writes: Mutex<Vec<Vec<u8>>>,
        resizes: Mutex<Vec<(u16, u16)>>,
    }

    impl MockPty {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                resizes: Mutex::new(Vec::new()),
            })
        }
    }

    impl PtyWriter for MockPty {
        fn write(&self, data: &[u8]) {
            self.writes.lock().unwrap().push(data.to_vec());
        }

        fn resize(&self, cols: u16, rows: u16) {
            self.resizes.lock().unwrap().push((cols, rows));
        }
    }

    struct MockPtyProvider {
        pty: Arc<MockPty>,
        fail: bool,
    }

    #[async_trait]
    impl PtyProvider for MockPtyProvider {
        async fn ensure_pty(&self) -> Result<Arc<dyn PtyWriter>> {
            if self.fail {
                return Err(crate::error::BridgeError::PtySpawn("mock failure".into()));
            }
            Ok(self.pty.clone() as Arc<dyn PtyWriter>)
        }
    }

    fn jwk_from(public: &RsaPublicKey) -> Jwk {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        Jwk {
            kty: "RSA".into(),
            n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        }
    }

    fn sign_challenge(private: &RsaPrivateKey, challenge: &[u8]) -> String {
        let signing_key = SigningKey::<Sha256>::new(private.clone());
        let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), challenge);
        hex::encode(signature.to_bytes())
    }

    fn new_session(
        keystore: Arc<KeyStore>,
        pending: Arc<PendingApprovals>,
        pty_ok: bool,
    ) -> (Session, Arc<MockPty>) {
        let pty = MockPty::new();
        let provider = Arc::new(MockPtyProvider {
            pty: pty.clone(),
            fail: !pty_ok,
        });
        let (session, _initial) = Session::new(keystore, pending, provider);
        (session, pty)
    }

    async fn empty_keystore() -> Arc<KeyStore> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("rootbridge-session-test-{}", Uuid::new_v4()));
        Arc::new(KeyStore::load(&dir.join("store.json")).await.unwrap())
    }

    #[tokio::test]
    async fn known_kid_with_valid_signature_advances_to_ecdh() {
        let keystore = empty_keystore().await;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = private.to_public_key();
        let jwk = jwk_from(&public);
        let kid = compute_kid(&jwk);
        keystore.insert(kid.clone(), jwk.clone()).await.unwrap();

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, _pty) = new_session(keystore, pending, true).await;
        let challenge = session.challenge.clone();
        let signature = sign_challenge(&private, &challenge);

        let out = session
            .handle_message(ClientMessage::AuthResponse {
                key_id: kid,
                signature,
                jwk: None,
            })
            .await;

        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Outbound::Send(ServerMessage::AuthSuccess)));
        assert!(matches!(&out[1], Outbound::Send(ServerMessage::E2eInit { .. })));
        assert_eq!(session.state, SessionState::AwaitingClientEcdh);
    }

    #[tokio::test]
    async fn known_kid_ignores_client_supplied_jwk_tofu_violation() {
        let keystore = empty_keystore().await;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = private.to_public_key();
        let jwk = jwk_from(&public);
        let kid = compute_kid(&jwk);
        keystore.insert(kid.clone(), jwk).await.unwrap();

        // A different keypair tries to claim the same kid with its own jwk.
        let attacker_private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let attacker_jwk = jwk_from(&attacker_private.to_public_key());
        let challenge_sig_from_attacker =
            sign_challenge(&attacker_private, b"irrelevant-because-verified-against-stored-key");

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, _pty) = new_session(keystore, pending, true).await;

        let out = session
            .handle_message(ClientMessage::AuthResponse {
                key_id: kid,
                signature: challenge_sig_from_attacker,
                jwk: Some(attacker_jwk),
            })
            .await;

        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Outbound::Send(ServerMessage::AuthError { .. })));
        assert_eq!(session.state, SessionState::AwaitingAuth);
    }

    #[tokio::test]
    async fn fourth_bad_signature_closes_with_1008() {
        let keystore = empty_keystore().await;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = private.to_public_key();
        let jwk = jwk_from(&public);
        let kid = compute_kid(&jwk);
        keystore.insert(kid.clone(), jwk).await.unwrap();

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, _pty) = new_session(keystore, pending, true).await;

        for _ in 0..3 {
            let out = session
                .handle_message(ClientMessage::AuthResponse {
                    key_id: kid.clone(),
                    signature: "00".repeat(32),
                    jwk: None,
                })
                .await;
            assert!(matches!(&out[0], Outbound::Send(ServerMessage::AuthError { .. })));
        }

        let out = session
            .handle_message(ClientMessage::AuthResponse {
                key_id: kid,
                signature: "00".repeat(32),
                jwk: None,
            })
            .await;
        assert!(matches!(
            &out[0],
            Outbound::Close { code: 1008, .. }
        ));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn unknown_kid_queues_pending_approval() {
        let keystore = empty_keystore().await;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let jwk = jwk_from(&private.to_public_key());
        let kid = compute_kid(&jwk);

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, _pty) = new_session(keystore, pending.clone(), true).await;
        let challenge = session.challenge.clone();
        let signature = sign_challenge(&private, &challenge);

        let out = session
            .handle_message(ClientMessage::AuthResponse {
                key_id: kid.clone(),
                signature,
                jwk: Some(jwk),
            })
            .await;

        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Outbound::WaitForApproval(_)));
        assert!(pending.contains(&kid));
        assert_eq!(session.state, SessionState::PendingApproval);
        assert_eq!(session.kid(), Some(kid.as_str()));
    }

    #[tokio::test]
    async fn unknown_kid_without_jwk_is_silently_dropped() {
        let keystore = empty_keystore().await;
        let kid = "does-not-exist".to_owned();

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, _pty) = new_session(keystore, pending.clone(), true).await;

        let out = session
            .handle_message(ClientMessage::AuthResponse {
                key_id: kid.clone(),
                signature: "00".repeat(32),
                jwk: None,
            })
            .await;

        assert!(out.is_empty());
        assert!(!pending.contains(&kid));
        assert_eq!(session.state, SessionState::AwaitingAuth);

        // A drop doesn't consume the attempt cap: three more of these
        // shouldn't close the session the way three bad signatures would.
        for _ in 0..3 {
            let out = session
                .handle_message(ClientMessage::AuthResponse {
                    key_id: kid.clone(),
                    signature: "00".repeat(32),
                    jwk: None,
                })
                .await;
            assert!(out.is_empty());
        }
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn unknown_kid_with_mismatched_jwk_is_silently_dropped() {
        let keystore = empty_keystore().await;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let jwk = jwk_from(&private.to_public_key());
        // Claim a kid that doesn't correspond to the attached jwk.
        let claimed_kid = "not-the-real-kid".to_owned();

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, _pty) = new_session(keystore, pending.clone(), true).await;
        let challenge = session.challenge.clone();
        let signature = sign_challenge(&private, &challenge);

        let out = session
            .handle_message(ClientMessage::AuthResponse {
                key_id: claimed_kid.clone(),
                signature,
                jwk: Some(jwk),
            })
            .await;

        assert!(out.is_empty());
        assert!(!pending.contains(&claimed_kid));
        assert_eq!(session.state, SessionState::AwaitingAuth);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn on_approved_advances_to_ecdh_using_the_stashed_kid() {
        let keystore = empty_keystore().await;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let jwk = jwk_from(&private.to_public_key());
        let kid = compute_kid(&jwk);

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, _pty) = new_session(keystore, pending, true).await;
        let challenge = session.challenge.clone();
        let signature = sign_challenge(&private, &challenge);

        session
            .handle_message(ClientMessage::AuthResponse {
                key_id: kid.clone(),
                signature,
                jwk: Some(jwk),
            })
            .await;
        assert_eq!(session.state, SessionState::PendingApproval);

        let out = session.on_approved();
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Outbound::Send(ServerMessage::Registered)));
        assert!(matches!(&out[1], Outbound::Send(ServerMessage::AuthSuccess)));
        assert!(matches!(&out[2], Outbound::Send(ServerMessage::E2eInit { .. })));
        assert_eq!(session.state, SessionState::AwaitingClientEcdh);
        assert_eq!(session.kid(), Some(kid.as_str()));
    }

    #[tokio::test]
    async fn full_handshake_reaches_streaming_and_forwards_input() {
        let keystore = empty_keystore().await;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let jwk = jwk_from(&private.to_public_key());
        let kid = compute_kid(&jwk);
        keystore.insert(kid.clone(), jwk).await.unwrap();

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, pty) = new_session(keystore, pending, true).await;
        let challenge = session.challenge.clone();
        let signature = sign_challenge(&private, &challenge);

        session
            .handle_message(ClientMessage::AuthResponse {
                key_id: kid,
                signature,
                jwk: None,
            })
            .await;

        let client_kex = EphemeralKex::generate();
        let client_pub = client_kex.public_key_bytes();
        let out = session
            .handle_message(ClientMessage::E2eClientKey {
                public_key: STANDARD.encode(client_pub),
            })
            .await;
        assert!(matches!(&out[0], Outbound::Send(ServerMessage::E2eReady { .. })));
        assert!(matches!(&out[1], Outbound::EnterStreaming));
        assert!(session.is_streaming());

        let plaintext = b"ls -la\n";
        let cipher = session.cipher.as_ref().unwrap();
        let frame = cipher.encrypt(plaintext).unwrap();
        session
            .handle_message(ClientMessage::E2eInput {
                iv: frame.iv,
                data: frame.data,
                tag: frame.tag,
            })
            .await;

        assert_eq!(pty.writes.lock().unwrap().as_slice(), [plaintext.to_vec()]);
    }

    #[tokio::test]
    async fn resize_out_of_bounds_is_ignored() {
        let keystore = empty_keystore().await;
        let pending = Arc::new(PendingApprovals::new());
        let (mut session, pty) = new_session(keystore, pending, true).await;
        session.state = SessionState::Streaming;
        session.pty = Some(pty.clone() as Arc<dyn PtyWriter>);

        session
            .handle_message(ClientMessage::Resize { cols: 0, rows: 30 })
            .await;
        assert!(pty.resizes.lock().unwrap().is_empty());

        session
            .handle_message(ClientMessage::Resize { cols: 80, rows: 30 })
            .await;
        assert_eq!(pty.resizes.lock().unwrap().as_slice(), [(80, 30)]);
    }

    #[tokio::test]
    async fn pty_provisioning_failure_closes_with_1011() {
        let keystore = empty_keystore().await;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let jwk = jwk_from(&private.to_public_key());
        let kid = compute_kid(&jwk);
        keystore.insert(kid.clone(), jwk).await.unwrap();

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, _pty) = new_session(keystore, pending, false).await;
        let challenge = session.challenge.clone();
        let signature = sign_challenge(&private, &challenge);
        session
            .handle_message(ClientMessage::AuthResponse {
                key_id: kid,
                signature,
                jwk: None,
            })
            .await;

        let client_kex = EphemeralKex::generate();
        let out = session
            .handle_message(ClientMessage::E2eClientKey {
                public_key: STANDARD.encode(client_kex.public_key_bytes()),
            })
            .await;
        assert!(matches!(&out[0], Outbound::Close { code: 1011, .. }));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn stale_challenge_closes_on_next_auth_response() {
        let keystore = empty_keystore().await;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let jwk = jwk_from(&private.to_public_key());
        let kid = compute_kid(&jwk);
        keystore.insert(kid.clone(), jwk).await.unwrap();

        let pending = Arc::new(PendingApprovals::new());
        let (mut session, _pty) = new_session(keystore, pending, true).await;
        let challenge = session.challenge.clone();
        let signature = sign_challenge(&private, &challenge);
        session.challenge_issued_at = Instant::now() - CHALLENGE_TTL - Duration::from_secs(1);

        let out = session
            .handle_message(ClientMessage::AuthResponse { key_id: kid, signature, jwk: None })
            .await;
        assert!(matches!(&out[0], Outbound::Close { code: 1008, .. }));
        assert!(session.is_closed());
    }
}
