//! Flow control windows.
//!
//! Credit-based accounting at both the stream and session level, split by
//! direction: a [`SendWindow`] tracks how much the peer will currently
//! accept from us, and a [`RecvWindow`] decides when body consumed by a
//! handler has earned the peer another window update.

/// Send-side credit for one stream or the whole connection.
///
/// Credit is spent as body bytes are serialized, granted back by peer
/// window updates, and shifted when a SETTINGS change moves the initial
/// window. A shrink can leave the window negative; egress stays blocked
/// until grants bring it positive again.
#[derive(Debug)]
pub struct SendWindow {
    credit: i64,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            credit: initial as i64,
        }
    }

    /// Credit currently available.
    pub fn available(&self) -> i32 {
        self.credit.clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }

    /// Whether any credit remains.
    pub fn is_open(&self) -> bool {
        self.credit > 0
    }

    /// Spend credit for serialized body bytes.
    pub fn spend(&mut self, bytes: u32) {
        self.credit -= bytes as i64;
    }

    /// Grant credit from a peer window update.
    pub fn grant(&mut self, bytes: u32) {
        self.credit += bytes as i64;
    }

    /// Shift the window for a changed initial window size.
    pub fn resize(&mut self, delta: i32) {
        self.credit += delta as i64;
    }
}

/// Receive-side accounting for one stream or the whole connection.
///
/// Consumed body accumulates until half the advertised window has been
/// freed, then comes back as one batched grant, so the peer sees few
/// large updates instead of one per chunk.
#[derive(Debug)]
pub struct RecvWindow {
    /// Window size the peer was advertised.
    limit: u32,
    /// Consumed bytes not yet returned as credit.
    unacked: u32,
}

impl RecvWindow {
    pub fn new(limit: u32) -> Self {
        Self { limit, unacked: 0 }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Record body consumed by the application. Returns the credit to
    /// hand back to the peer once enough has accumulated.
    pub fn on_consumed(&mut self, bytes: u32) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(bytes);
        if self.unacked > 0 && self.unacked >= self.limit / 2 {
            let grant = self.unacked;
            self.unacked = 0;
            Some(grant)
        } else {
            None
        }
    }

    /// Extra credit granted out of band (an explicit window update from
    /// the handler); the peer now sees a larger window.
    pub fn grant_extra(&mut self, bytes: u32) {
        self.limit = self.limit.saturating_add(bytes);
    }
}

/// Connection-level send window with open-transition reporting.
///
/// Wraps the session [`SendWindow`] and reports the moment credit
/// reappears after exhaustion, which is the signal to re-queue every
/// transaction with pending egress.
#[derive(Debug)]
pub struct ConnFlowControl {
    window: SendWindow,
}

impl ConnFlowControl {
    pub fn new(initial: u32) -> Self {
        Self {
            window: SendWindow::new(initial),
        }
    }

    pub fn available(&self) -> i32 {
        self.window.available()
    }

    pub fn is_open(&self) -> bool {
        self.window.is_open()
    }

    pub fn spend(&mut self, bytes: u32) {
        self.window.spend(bytes);
    }

    /// Apply a connection window update. Returns true when the window
    /// crossed from closed to open.
    pub fn grant(&mut self, bytes: u32) -> bool {
        let was_open = self.window.is_open();
        self.window.grant(bytes);
        !was_open && self.window.is_open()
    }
}
