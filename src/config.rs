//! Session configuration.

use std::time::Duration;

/// Tunables for a single session.
///
/// Every knob is fixed at construction; the session never consults shared
/// mutable configuration at runtime.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum ingress body bytes buffered across all transactions before
    /// transport reads are paused.
    pub read_buf_limit: usize,
    /// Maximum bytes submitted to the transport but not yet written before
    /// all transactions' egress is paused.
    pub pending_write_max: usize,
    /// Largest body slice encoded for one transaction per scheduler turn.
    pub egress_body_quantum: usize,
    /// Maximum concurrent locally-initiated streams (local configuration;
    /// the effective cap is the min of this and the remote's advertised
    /// value).
    pub max_concurrent_outgoing_streams: u32,
    /// Maximum concurrent peer-initiated streams.
    pub max_concurrent_incoming_streams: u32,
    /// Maximum concurrent pushed streams.
    pub max_concurrent_push_transactions: u32,
    /// Initial receive window advertised for new streams via SETTINGS.
    pub initial_receive_window: u32,
    /// Per-stream receive window grown to via WINDOW_UPDATE on admission.
    pub receive_stream_window_size: u32,
    /// Per-session receive window grown to via WINDOW_UPDATE at start.
    pub receive_session_window_size: u32,
    /// Abort the session when no ingress arrives for this long.
    pub read_timeout: Option<Duration>,
    /// Abort the session when a submitted write takes this long.
    pub write_timeout: Option<Duration>,
    /// Abort a transaction that makes no progress for this long.
    pub transaction_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buf_limit: 64 * 1024,
            pending_write_max: 64 * 1024,
            egress_body_quantum: 4096,
            max_concurrent_outgoing_streams: 100,
            max_concurrent_incoming_streams: 100,
            max_concurrent_push_transactions: 100,
            initial_receive_window: 65536,
            receive_stream_window_size: 65536,
            receive_session_window_size: 65536,
            read_timeout: None,
            write_timeout: None,
            transaction_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the aggregate ingress buffering limit.
    pub fn read_buf_limit(mut self, value: usize) -> Self {
        self.read_buf_limit = value;
        self
    }

    /// Set the unwritten-egress cap.
    pub fn pending_write_max(mut self, value: usize) -> Self {
        self.pending_write_max = value;
        self
    }

    /// Set the per-turn egress quantum.
    pub fn egress_body_quantum(mut self, value: usize) -> Self {
        self.egress_body_quantum = value;
        self
    }

    /// Set the locally-configured outgoing stream cap.
    pub fn max_concurrent_outgoing_streams(mut self, value: u32) -> Self {
        self.max_concurrent_outgoing_streams = value;
        self
    }

    /// Set the incoming stream cap.
    pub fn max_concurrent_incoming_streams(mut self, value: u32) -> Self {
        self.max_concurrent_incoming_streams = value;
        self
    }

    /// Set the pushed stream cap.
    pub fn max_concurrent_push_transactions(mut self, value: u32) -> Self {
        self.max_concurrent_push_transactions = value;
        self
    }

    /// Set the flow control windows advertised to the peer.
    pub fn flow_control(
        mut self,
        initial_receive_window: u32,
        receive_stream_window: u32,
        receive_session_window: u32,
    ) -> Self {
        self.initial_receive_window = initial_receive_window;
        self.receive_stream_window_size = receive_stream_window;
        self.receive_session_window_size = receive_session_window;
        self
    }

    /// Set the session read timeout.
    pub fn read_timeout(mut self, value: Duration) -> Self {
        self.read_timeout = Some(value);
        self
    }

    /// Set the in-flight write timeout.
    pub fn write_timeout(mut self, value: Duration) -> Self {
        self.write_timeout = Some(value);
        self
    }

    /// Set the per-transaction progress timeout.
    pub fn transaction_timeout(mut self, value: Duration) -> Self {
        self.transaction_timeout = Some(value);
        self
    }
}
