//! Broadcast Hub: fans sanitized PTY output out to every streaming
//! connection, each encrypted under that connection's own session key, and
//! keeps a bounded replay buffer so a newly attached session sees recent
//! context instead of a blank screen.
//!
//! A keyed map of live session handles plus broadcast-style notification,
//! generalized from "notify on state change" to "deliver these bytes".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

/// Bound on the replay buffer: a bounded tail of PTY output, post-sanitization.
pub const REPLAY_BUFFER_CAP: usize = 50 * 1024;

/// A single streaming connection's delivery target. Implementations own the
/// connection's `SessionCipher` and WebSocket sink, encrypting plaintext PTY
/// output before writing it to the socket.
pub trait HubSink: Send + Sync {
    fn deliver(&self, plaintext: &[u8]);
    fn close(&self, code: u16, reason: &str);
}

struct HubInner {
    sinks: HashMap<Uuid, Arc<dyn HubSink>>,
    replay: VecDeque<u8>,
}

impl Default for HubInner {
    fn default() -> Self {
        Self {
            sinks: HashMap::new(),
            replay: VecDeque::new(),
        }
    }
}

/// Registry of every connection currently in `streaming`, plus the replay
/// buffer. One per daemon; lives as long as the daemon does, independent of
/// the PTY's own lifecycle (a Hub outlives any single shell process).
#[derive(Default)]
pub struct Hub {
    inner: RwLock<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a newly streaming session: registers it and immediately
    /// replays the current buffer to it.
    pub async fn attach(&self, id: Uuid, sink: Arc<dyn HubSink>) {
        let mut guard = self.inner.write().await;
        if !guard.replay.is_empty() {
            let (first, second) = guard.replay.as_slices();
            let mut buf = Vec::with_capacity(first.len() + second.len());
            buf.extend_from_slice(first);
            buf.extend_from_slice(second);
            sink.deliver(&buf);
        }
        guard.sinks.insert(id, sink);
    }

    /// Removes a session without error if it is absent.
    pub async fn detach(&self, id: &Uuid) {
        self.inner.write().await.sinks.remove(id);
    }

    /// Appends to the replay buffer (truncating to `REPLAY_BUFFER_CAP`) and
    /// delivers to every attached sink in publish order. A single
    /// misbehaving sink never blocks the others: `deliver` must not do
    /// blocking I/O itself (implementations push onto an unbounded channel
    /// and let a dedicated writer task handle the socket).
    pub async fn publish(&self, plaintext: &[u8]) {
        let mut guard = self.inner.write().await;
        guard.replay.extend(plaintext.iter().copied());
        while guard.replay.len() > REPLAY_BUFFER_CAP {
            guard.replay.pop_front();
        }
        for sink in guard.sinks.values() {
            sink.deliver(plaintext);
        }
    }

    pub async fn close_all(&self, code: u16, reason: &str) {
        let guard = self.inner.read().await;
        for sink in guard.sinks.values() {
            sink.close(code, reason);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.sinks.len()
    }

    /// Drops the replay buffer. Called when the PTY is torn down, since the
    /// buffer's context is only meaningful for the PTY that produced it.
    pub async fn clear_replay_buffer(&self) {
        self.inner.write().await.replay.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        received: Mutex<Vec<Vec<u8>>>,
        closed: Mutex<Option<(u16, String)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                closed: Mutex::new(None),
            })
        }
    }

    impl HubSink for RecordingSink {
        fn deliver(&self, plaintext: &[u8]) {
            self.received.lock().unwrap().push(plaintext.to_vec());
        }

        fn close(&self, code: u16, reason: &str) {
            *self.closed.lock().unwrap() = Some((code, reason.to_owned()));
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_attached_sink() {
        let hub = Hub::new();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        hub.attach(Uuid::new_v4(), a.clone()).await;
        hub.attach(Uuid::new_v4(), b.clone()).await;

        hub.publish(b"hello").await;

        assert_eq!(a.received.lock().unwrap().last().unwrap(), b"hello");
        assert_eq!(b.received.lock().unwrap().last().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn detached_sink_stops_receiving() {
        let hub = Hub::new();
        let id = Uuid::new_v4();
        let sink = RecordingSink::new();
        hub.attach(id, sink.clone()).await;
        hub.detach(&id).await;

        hub.publish(b"later").await;

        assert!(sink.received.lock().unwrap().iter().all(|v| v != b"later"));
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn close_all_notifies_every_sink() {
        let hub = Hub::new();
        let sink = RecordingSink::new();
        hub.attach(Uuid::new_v4(), sink.clone()).await;

        hub.close_all(1001, "daemon stopping").await;

        assert_eq!(
            sink.closed.lock().unwrap().clone(),
            Some((1001, "daemon stopping".to_owned()))
        );
    }

    #[tokio::test]
    async fn newly_attached_session_receives_replay_buffer_first() {
        let hub = Hub::new();
        hub.publish(b"hello\r\n$ ").await;

        let late = RecordingSink::new();
        hub.attach(Uuid::new_v4(), late.clone()).await;

        assert_eq!(late.received.lock().unwrap().first().unwrap(), b"hello\r\n$ ");
    }

    #[tokio::test]
    async fn replay_buffer_truncates_to_cap() {
        let hub = Hub::new();
        let chunk = vec![b'x'; REPLAY_BUFFER_CAP / 2];
        hub.publish(&chunk).await;
        hub.publish(&chunk).await;
        hub.publish(&chunk).await;

        let late = RecordingSink::new();
        hub.attach(Uuid::new_v4(), late.clone()).await;
        let replayed = late.received.lock().unwrap().first().unwrap().clone();
        assert_eq!(replayed.len(), REPLAY_BUFFER_CAP);
    }
}
