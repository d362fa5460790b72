//! Pending-identity queue bridging a Session's `await_auth` (pending)
//! sub-state to the Control Surface's `approve(kid)` command.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::crypto::Jwk;

struct PendingEntry {
    jwk: Jwk,
    waiters: Vec<oneshot::Sender<()>>,
}

/// One outstanding first-time pairing request per `kid`. A session that
/// receives a valid, unknown-kid `auth_response` registers itself here and
/// waits on the returned receiver; `take` (driven by `approve(kid)`) wakes
/// every waiter so their sessions can proceed to `awaiting_client_ecdh`.
#[derive(Default)]
pub struct PendingApprovals {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a wait for `kid`'s approval. Later calls for the same kid
    /// (e.g. a second connection with the same unapproved identity) share the
    /// same pending entry and are all woken by a single `take`.
    pub fn register(&self, kid: String, jwk: Jwk) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock().expect("pending approvals lock poisoned");
        guard
            .entry(kid)
            .or_insert_with(|| PendingEntry { jwk, waiters: Vec::new() })
            .waiters
            .push(tx);
        rx
    }

    /// Removes the pending entry for `kid`, returning its JWK and every
    /// waiter so the caller can persist the identity and then wake sessions.
    pub fn take(&self, kid: &str) -> Option<(Jwk, Vec<oneshot::Sender<()>>)> {
        let entry = self
            .inner
            .lock()
            .expect("pending approvals lock poisoned")
            .remove(kid);
        entry.map(|e| (e.jwk, e.waiters))
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.inner
            .lock()
            .expect("pending approvals lock poisoned")
            .contains_key(kid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_jwk() -> Jwk {
        Jwk {
            kty: "RSA".into(),
            n: "n".into(),
            e: "AQAB".into(),
        }
    }

    #[test]
    fn take_wakes_every_registered_waiter() {
        let pending = PendingApprovals::new();
        let rx1 = pending.register("kid1".into(), sample_jwk());
        let rx2 = pending.register("kid1".into(), sample_jwk());
        assert!(pending.contains("kid1"));

        let (jwk, waiters) = pending.take("kid1").expect("entry present");
        assert_eq!(jwk.n, "n");
        for w in waiters {
            let _ = w.send(());
        }

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(!pending.contains("kid1"));
    }

    #[test]
    fn take_on_unknown_kid_is_none() {
        let pending = PendingApprovals::new();
        assert!(pending.take("nope").is_none());
    }
}
