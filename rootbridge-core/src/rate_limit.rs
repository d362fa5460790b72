//! Rate & Quota Guard: connect-window limiting, per-connection auth attempt
//! counting, and the frame/payload/resize bounds enforced everywhere else in
//! the daemon.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::error::{BridgeError, Result};

/// Hard cap on accepted upgrades per 60-second window.
pub const MAX_UPGRADES_PER_WINDOW: u32 = 20;
/// Per-connection cap on bad `auth_response` attempts before the socket is closed.
pub const MAX_AUTH_ATTEMPTS: u32 = 3;
/// Hard cap on any single WebSocket frame, enforced at the front door.
pub const MAX_FRAME_BYTES: usize = 65_536;
/// Decoded `e2e_input` payloads are truncated (not rejected) beyond this.
pub const MAX_INPUT_BYTES: usize = 4_096;

pub const MIN_COLS: u16 = 1;
pub const MAX_COLS: u16 = 500;
pub const MIN_ROWS: u16 = 1;
pub const MAX_ROWS: u16 = 200;

/// Governs how many new WebSocket upgrades the front door accepts per
/// 60-second window. Unkeyed: there is one listener, not one limiter per
/// user.
pub struct ConnectGuard {
    inner: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl ConnectGuard {
    pub fn new() -> Self {
        let quota = Quota::with_period(Duration::from_secs(60))
            .expect("60s is a nonzero duration")
            .allow_burst(NonZeroU32::new(MAX_UPGRADES_PER_WINDOW).expect("20 is nonzero"));
        Self {
            inner: RateLimiter::direct(quota),
        }
    }

    /// Returns `Ok(())` if this upgrade may proceed, `Err(RateLimited)` if
    /// the window's connection budget is exhausted and the caller should
    /// close the socket with 1008 before speaking any protocol.
    pub fn check_upgrade(&self) -> Result<()> {
        self.inner.check().map_err(|_| BridgeError::RateLimited)
    }
}

impl Default for ConnectGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks bad signature attempts on a single connection. Lives for the
/// lifetime of one Session; not shared across connections.
#[derive(Debug, Default)]
pub struct AuthAttempts {
    count: AtomicU32,
}

impl AuthAttempts {
    pub fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Records one failed attempt and returns an error once the cap is
    /// exceeded (the caller closes with 1008 on the 4th bad signature).
    pub fn record_failure(&self) -> Result<()> {
        let previous = self.count.fetch_add(1, Ordering::SeqCst);
        if previous + 1 > MAX_AUTH_ATTEMPTS {
            return Err(BridgeError::TooManyAuthAttempts);
        }
        Ok(())
    }
}

/// Truncates (never rejects) a decrypted input payload to the daemon's
/// per-message cap, preserving paste resilience.
pub fn truncate_input(payload: &[u8]) -> &[u8] {
    if payload.len() > MAX_INPUT_BYTES {
        &payload[..MAX_INPUT_BYTES]
    } else {
        payload
    }
}

/// Validates a raw WebSocket frame against the hard size cap. The caller
/// drops the frame (does not close the connection) on a violation.
pub fn check_frame_size(frame: &[u8]) -> Result<()> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(BridgeError::FrameTooLarge(frame.len()));
    }
    Ok(())
}

/// Clamps a client-requested terminal size to the allowed range. Out-of-range
/// values are a no-op, not an error: returns `None` when either dimension
/// falls outside bounds so the caller can ignore the request.
pub fn clamp_resize(cols: i64, rows: i64) -> Option<(u16, u16)> {
    let cols: u16 = cols.try_into().ok()?;
    let rows: u16 = rows.try_into().ok()?;
    if !(MIN_COLS..=MAX_COLS).contains(&cols) || !(MIN_ROWS..=MAX_ROWS).contains(&rows) {
        return None;
    }
    Some((cols, rows))
}
