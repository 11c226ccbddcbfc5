//! Session-level deadline tracking.
//!
//! The session owns no timer facility; it records deadlines and the
//! driver polls `Session::poll_timeouts` (typically once per loop tick)
//! and may use `next_deadline` to arm a wakeup.

use std::time::{Duration, Instant};

/// Read and write deadline bookkeeping.
#[derive(Debug)]
pub struct Timeouts {
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    /// Last time ingress arrived.
    last_ingress: Instant,
    /// When the oldest in-flight write was submitted.
    oldest_write: Option<Instant>,
}

impl Timeouts {
    pub fn new(read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
        Self {
            read_timeout,
            write_timeout,
            last_ingress: Instant::now(),
            oldest_write: None,
        }
    }

    /// Ingress arrived; push the read deadline out.
    pub fn on_ingress(&mut self, now: Instant) {
        self.last_ingress = now;
    }

    /// A write was submitted; arm the write deadline if idle.
    pub fn on_write_submitted(&mut self, now: Instant) {
        if self.oldest_write.is_none() {
            self.oldest_write = Some(now);
        }
    }

    /// A write completed. `more_in_flight` keeps the deadline armed,
    /// restarted from now.
    pub fn on_write_completed(&mut self, now: Instant, more_in_flight: bool) {
        self.oldest_write = if more_in_flight { Some(now) } else { None };
    }

    /// Whether the read deadline has passed.
    pub fn read_expired(&self, now: Instant) -> bool {
        match self.read_timeout {
            Some(limit) => now.duration_since(self.last_ingress) >= limit,
            None => false,
        }
    }

    /// Whether the in-flight write deadline has passed.
    pub fn write_expired(&self, now: Instant) -> bool {
        match (self.write_timeout, self.oldest_write) {
            (Some(limit), Some(since)) => now.duration_since(since) >= limit,
            _ => false,
        }
    }

    /// Earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let read = self.read_timeout.map(|limit| self.last_ingress + limit);
        let write = self
            .write_timeout
            .and_then(|limit| self.oldest_write.map(|since| since + limit));
        match (read, write) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (Some(r), None) => Some(r),
            (None, Some(w)) => Some(w),
            (None, None) => None,
        }
    }
}
