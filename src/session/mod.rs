//! Session state machine.
//!
//! This module implements the session layer, handling:
//! - Ingress parsing and per-transaction event delivery
//! - Transaction lifecycle and admission caps
//! - Egress scheduling across a priority queue of streams
//! - Flow control (connection and stream level)
//! - Backpressure against the transport and the handlers
//! - Graceful and abrupt shutdown
//!
//! The session is bound to a single event loop. Every entry point runs on
//! that loop; nothing blocks, and deferred work is expressed through one
//! end-of-loop write callback.

mod byte_events;
mod egress_queue;
mod flow_control;
pub mod handler;
mod timeouts;
mod transaction;
mod write_segment;

pub use byte_events::{ByteEvent, ByteEventKind, ByteEventTracker};
pub use egress_queue::EgressQueue;
pub use flow_control::{ConnFlowControl, RecvWindow, SendWindow};
pub use handler::{
    DirectResponseHandler, InfoCallback, SessionController, TransactionHandler, TxnCtx,
};
pub use transaction::{EgressPiece, HalfState, IngressEvent, Transaction, TxnOrigin};
pub use write_segment::{PendingWrites, WriteSegment};

use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::codec::{
    CodecError, CodecEvent, ErrorCode, HeaderField, Message, SessionCodec, Setting, SettingId,
    StreamId, TransportDirection,
};
use crate::config::SessionConfig;
use crate::error::{ConnectionCloseReason, Error};
use crate::metrics;
use crate::transport::{Transport, WriteFlags};
use timeouts::Timeouts;

/// Per-axis I/O state. Pausing is reversible; shutdown is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum IoState {
    #[default]
    Open,
    Paused,
    Shutdown,
}

impl IoState {
    fn is_shutdown(self) -> bool {
        self == IoState::Shutdown
    }
}

/// Session phase flags. The booleans are monotonic: once set they never
/// clear.
#[derive(Debug, Default)]
struct Phase {
    started: bool,
    draining: bool,
    goaway_final_sent: bool,
    writes_draining: bool,
    reset_after_draining_writes: bool,
    ingress_error: bool,
    in_loop_callback: bool,
    write_scheduled: bool,
    destroyed: bool,
    reads: IoState,
    writes: IoState,
}

/// One end of a transport connection, multiplexing transactions over a
/// pluggable codec.
pub struct Session {
    direction: TransportDirection,
    config: SessionConfig,
    transport: Box<dyn Transport>,
    codec: Box<dyn SessionCodec>,
    controller: Box<dyn SessionController>,
    info: Option<Box<dyn InfoCallback>>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Scratch for codec event batches, reused across reads.
    codec_events: Vec<CodecEvent>,
    /// Scratch for fired byte events, reused across completions.
    fired_events: Vec<ByteEvent>,

    transactions: HashMap<StreamId, Transaction>,
    egress_queue: EgressQueue,
    pending_writes: PendingWrites,
    byte_events: ByteEventTracker,
    conn_send_window: ConnFlowControl,
    conn_recv_window: RecvWindow,
    /// Peer's initial per-stream send window, updated by SETTINGS.
    remote_initial_window: u32,

    outgoing_streams: u32,
    incoming_streams: u32,
    pushed_txns: u32,
    max_outgoing_remote: u32,
    outgoing_full_reported: bool,
    highest_incoming_stream: Option<StreamId>,

    /// Ingress body bytes buffered across all transactions.
    pending_read_size: usize,
    /// High-water mark of `pending_read_size`.
    max_ingress_buffered: usize,
    /// Bytes submitted to the transport and not yet completed.
    pending_write_size: usize,
    bytes_written: u64,
    bytes_scheduled: u64,
    num_active_writes: u32,

    outstanding_pings: VecDeque<(u64, Instant)>,
    next_ping_id: u64,

    /// Streams recently refused or reset; their trailing ingress is
    /// absorbed without another reset. Bounded ring.
    recently_reset: VecDeque<StreamId>,

    /// Offset of the most recent EOM byte serialized this scheduler turn.
    turn_last_eom: Option<u64>,

    phase: Phase,
    close_reason: ConnectionCloseReason,
    timeouts: Timeouts,
}

impl Session {
    /// Create a session over an established transport.
    ///
    /// The direction is fixed for the session's lifetime: upstream acts as
    /// a client, downstream as a server.
    pub fn new(
        direction: TransportDirection,
        transport: Box<dyn Transport>,
        codec: Box<dyn SessionCodec>,
        controller: Box<dyn SessionController>,
        config: SessionConfig,
    ) -> Self {
        let conn_window = codec.initial_conn_send_window();
        let stream_window = codec.initial_send_window();
        let timeouts = Timeouts::new(config.read_timeout, config.write_timeout);
        metrics::SESSIONS_CREATED.increment();
        metrics::SESSIONS_ACTIVE.increment();
        Session {
            direction,
            transport,
            codec,
            controller,
            info: None,
            read_buf: BytesMut::with_capacity(16384),
            write_buf: BytesMut::with_capacity(16384),
            codec_events: Vec::new(),
            fired_events: Vec::new(),
            transactions: HashMap::new(),
            egress_queue: EgressQueue::new(),
            pending_writes: PendingWrites::new(),
            byte_events: ByteEventTracker::new(),
            conn_send_window: ConnFlowControl::new(conn_window),
            conn_recv_window: RecvWindow::new(config.receive_session_window_size),
            remote_initial_window: stream_window,
            outgoing_streams: 0,
            incoming_streams: 0,
            pushed_txns: 0,
            max_outgoing_remote: u32::MAX,
            outgoing_full_reported: false,
            highest_incoming_stream: None,
            pending_read_size: 0,
            max_ingress_buffered: 0,
            pending_write_size: 0,
            bytes_written: 0,
            bytes_scheduled: 0,
            num_active_writes: 0,
            outstanding_pings: VecDeque::new(),
            next_ping_id: 1,
            recently_reset: VecDeque::new(),
            turn_last_eom: None,
            phase: Phase::default(),
            close_reason: ConnectionCloseReason::None,
            timeouts,
            config,
        }
    }

    /// Install the lifecycle observer. Fires `on_create`.
    pub fn set_info_callback(&mut self, mut info: Box<dyn InfoCallback>) {
        info.on_create();
        self.info = Some(info);
    }

    /// Send any introductory frames (preface, SETTINGS, initial window
    /// updates) and mark the session started. Must be called once.
    pub fn start_now(&mut self) {
        if self.phase.started || self.phase.destroyed {
            return;
        }
        self.phase.started = true;

        let n = self.codec.generate_connection_preface(&mut self.write_buf);
        self.bytes_scheduled += n as u64;

        let settings = [
            Setting {
                id: SettingId::MaxConcurrentStreams,
                value: self.config.max_concurrent_incoming_streams,
            },
            Setting {
                id: SettingId::InitialWindowSize,
                value: self.config.initial_receive_window,
            },
        ];
        let res = self.codec.generate_settings(&mut self.write_buf, &settings);
        self.note_encoded_lossy(res);

        // Grow the session receive window past the protocol default.
        if self.codec.supports_stream_multiplexing() {
            let default = crate::codec::DEFAULT_INITIAL_WINDOW_SIZE;
            if self.config.receive_session_window_size > default {
                let delta = self.config.receive_session_window_size - default;
                let res = self.codec.generate_window_update(
                    &mut self.write_buf,
                    StreamId::CONNECTION,
                    delta,
                );
                self.note_encoded_lossy(res);
            }
        }
        self.schedule_write();
    }

    // === Queries ===

    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    pub fn is_upstream(&self) -> bool {
        self.direction == TransportDirection::Upstream
    }

    pub fn is_downstream(&self) -> bool {
        self.direction == TransportDirection::Downstream
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    pub fn is_draining(&self) -> bool {
        self.phase.draining
    }

    pub fn writes_draining(&self) -> bool {
        self.phase.writes_draining
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase.destroyed
    }

    /// Whether the session still has work in flight.
    pub fn is_busy(&self) -> bool {
        !self.transactions.is_empty() || self.has_more_writes()
    }

    pub fn has_active_transactions(&self) -> bool {
        !self.transactions.is_empty()
    }

    pub fn num_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn num_incoming_streams(&self) -> u32 {
        self.incoming_streams
    }

    pub fn num_outgoing_streams(&self) -> u32 {
        self.outgoing_streams
    }

    /// Effective cap on locally-initiated streams.
    pub fn max_concurrent_outgoing_streams(&self) -> u32 {
        self.config
            .max_concurrent_outgoing_streams
            .min(self.max_outgoing_remote)
    }

    /// Whether a new outgoing transaction can be opened right now.
    pub fn supports_more_transactions(&self) -> bool {
        !self.phase.draining
            && !self.phase.destroyed
            && !self.phase.writes.is_shutdown()
            && self.outgoing_streams < self.max_concurrent_outgoing_streams()
    }

    pub fn pending_read_size(&self) -> usize {
        self.pending_read_size
    }

    pub fn pending_write_size(&self) -> usize {
        self.pending_write_size
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_scheduled(&self) -> u64 {
        self.bytes_scheduled
    }

    pub fn num_active_writes(&self) -> u32 {
        self.num_active_writes
    }

    /// Offset of the next byte to be serialized within the session.
    pub fn session_byte_offset(&self) -> u64 {
        self.bytes_scheduled
    }

    pub fn connection_close_reason(&self) -> ConnectionCloseReason {
        self.close_reason
    }

    // === Outgoing transactions ===

    /// Open a locally-initiated transaction. Fails while draining or over
    /// the outgoing-stream cap.
    pub fn new_transaction(
        &mut self,
        handler: Box<dyn TransactionHandler>,
        priority: u8,
    ) -> Result<StreamId, Error> {
        if !self.supports_more_transactions() {
            return Err(Error::SessionClosed);
        }
        let id = self.codec.next_outgoing_stream_id();
        self.admit_transaction(id, TxnOrigin::Outgoing, priority, Some(handler));
        Ok(id)
    }

    pub(crate) fn new_pushed_transaction(
        &mut self,
        assoc: StreamId,
        handler: Box<dyn TransactionHandler>,
        priority: u8,
    ) -> Result<StreamId, Error> {
        if self.direction != TransportDirection::Downstream
            || !self.codec.supports_push_transactions()
        {
            return Err(Error::SessionClosed);
        }
        if self.phase.draining || self.phase.writes.is_shutdown() {
            return Err(Error::SessionClosed);
        }
        if self.pushed_txns >= self.config.max_concurrent_push_transactions {
            metrics::TRANSACTIONS_REFUSED.increment();
            return Err(Error::StreamRefused);
        }
        if !self.transactions.contains_key(&assoc) {
            return Err(Error::SessionClosed);
        }
        let id = self.codec.next_outgoing_stream_id();
        self.admit_transaction(id, TxnOrigin::PushedLocal { assoc }, priority, Some(handler));
        Ok(id)
    }

    /// Send a ping if the codec supports it. Returns bytes written to the
    /// codec (0 when unsupported).
    pub fn send_ping(&mut self) -> usize {
        let id = self.next_ping_id;
        let res = self.codec.generate_ping_request(&mut self.write_buf, id);
        match self.note_encoded(res) {
            Ok(0) | Err(_) => 0,
            Ok(n) => {
                self.next_ping_id += 1;
                self.outstanding_pings.push_back((id, Instant::now()));
                metrics::PINGS_SENT.increment();
                self.schedule_write();
                n
            }
        }
    }

    // === Ingress pipeline ===

    /// Transport read callback: `data` was read from the peer.
    pub fn on_read_data(&mut self, data: &[u8]) {
        if self.phase.destroyed || self.phase.reads.is_shutdown() || self.phase.ingress_error {
            return;
        }
        metrics::BYTES_READ.add(data.len() as u64);
        if let Some(info) = self.info.as_deref_mut() {
            info.on_read(data.len());
        }
        self.timeouts.on_ingress(Instant::now());
        self.read_buf.extend_from_slice(data);
        self.process_read_buf();
        self.check_read_backpressure();
    }

    /// Transport read callback: the peer closed its write side.
    pub fn on_read_eof(&mut self) {
        if self.phase.destroyed || self.phase.reads.is_shutdown() {
            return;
        }
        debug!("read EOF");
        self.set_close_reason(ConnectionCloseReason::ReadEof);
        // Transactions that were still receiving get an EOF error; egress
        // keeps flowing until it drains.
        let affected: Vec<StreamId> = self
            .transactions
            .values()
            .filter(|t| !t.ingress_state.is_closed())
            .map(|t| t.id())
            .collect();
        self.mass_error(affected, &Error::IngressEof, false);
        self.phase.writes_draining = true;
        self.shutdown_transport_impl(true, false);
        self.try_finish_write_drain();
    }

    /// Transport read callback: the read side failed.
    pub fn on_read_error(&mut self, err: io::Error) {
        if self.phase.destroyed || self.phase.reads.is_shutdown() {
            return;
        }
        warn!(error = %err, "read error");
        self.set_close_reason(ConnectionCloseReason::IoReadError);
        let error = Error::Transport(err);
        if let Some(info) = self.info.as_deref_mut() {
            info.on_ingress_error(&error);
        }
        let ids = self.snapshot_ids();
        self.mass_error(ids, &error, false);
        self.shutdown_transport_impl(true, true);
    }

    fn process_read_buf(&mut self) {
        loop {
            if self.phase.ingress_error
                || self.phase.destroyed
                || self.phase.reads.is_shutdown()
            {
                break;
            }
            let mut events = mem::take(&mut self.codec_events);
            events.clear();
            let consumed = self.codec.on_ingress(&mut self.read_buf, &mut events);
            let produced = events.len();
            for event in events.drain(..) {
                if self.phase.ingress_error || self.phase.destroyed {
                    break;
                }
                self.dispatch_codec_event(event);
            }
            self.codec_events = events;
            if consumed == 0 && produced == 0 {
                break;
            }
        }
    }

    fn dispatch_codec_event(&mut self, event: CodecEvent) {
        match event {
            CodecEvent::MessageBegin {
                stream_id,
                priority,
            } => self.on_message_begin(stream_id, priority),
            CodecEvent::PushMessageBegin {
                stream_id,
                assoc_stream_id,
            } => self.on_push_message_begin(stream_id, assoc_stream_id),
            CodecEvent::HeadersComplete { stream_id, msg } => {
                self.on_headers_complete(stream_id, msg)
            }
            CodecEvent::Body { stream_id, chunk } => self.on_body(stream_id, chunk),
            CodecEvent::ChunkHeader { stream_id, length } => {
                self.on_ingress_event(stream_id, IngressEvent::ChunkHeader(length))
            }
            CodecEvent::ChunkComplete { stream_id } => {
                self.on_ingress_event(stream_id, IngressEvent::ChunkComplete)
            }
            CodecEvent::TrailersComplete {
                stream_id,
                trailers,
            } => self.on_ingress_event(stream_id, IngressEvent::Trailers(trailers)),
            CodecEvent::MessageComplete { stream_id, upgrade } => {
                self.on_ingress_event(stream_id, IngressEvent::MessageComplete { upgrade })
            }
            CodecEvent::Error {
                stream_id,
                error,
                new_txn,
            } => self.on_parse_error(stream_id, error, new_txn),
            CodecEvent::Abort { stream_id, code } => self.on_ingress_abort(stream_id, code),
            CodecEvent::Goaway {
                last_good_stream_id,
                code,
            } => self.on_goaway(last_good_stream_id, code),
            CodecEvent::PingRequest { id } => self.on_ping_request(id),
            CodecEvent::PingReply { id } => self.on_ping_reply(id),
            CodecEvent::WindowUpdate { stream_id, delta } => {
                self.on_window_update(stream_id, delta)
            }
            CodecEvent::Settings { settings } => self.on_settings(settings),
        }
    }

    fn on_message_begin(&mut self, id: StreamId, priority: u8) {
        if self.transactions.contains_key(&id) || self.was_recently_reset(id) {
            return;
        }
        match self.direction {
            TransportDirection::Upstream => {
                // A response must belong to a transaction we initiated.
                self.invalid_stream(id);
            }
            TransportDirection::Downstream => {
                if self.phase.draining
                    || self.incoming_streams >= self.config.max_concurrent_incoming_streams
                {
                    self.refuse_stream(id);
                    return;
                }
                self.admit_transaction(id, TxnOrigin::Incoming, priority, None);
                if let Some(info) = self.info.as_deref_mut() {
                    info.on_request_begin();
                }
            }
        }
    }

    fn on_push_message_begin(&mut self, id: StreamId, assoc: StreamId) {
        if self.direction != TransportDirection::Upstream {
            self.on_session_parse_error(CodecError::new(
                ErrorCode::ProtocolError,
                "push promise from client",
            ));
            return;
        }
        if self.transactions.contains_key(&id) || !self.transactions.contains_key(&assoc) {
            self.invalid_stream(id);
            return;
        }
        if self.phase.draining || self.pushed_txns >= self.config.max_concurrent_push_transactions
        {
            self.refuse_stream(id);
            return;
        }
        // Ask the associated transaction's handler to accept the push.
        let mut accepted: Option<Box<dyn TransactionHandler>> = None;
        self.deliver(assoc, |h, ctx| {
            accepted = h.on_pushed_transaction(ctx, id);
        });
        let Some(handler) = accepted else {
            self.refuse_stream(id);
            return;
        };
        self.admit_transaction(id, TxnOrigin::PushedRemote { assoc }, 0, Some(handler));
    }

    fn admit_transaction(
        &mut self,
        id: StreamId,
        origin: TxnOrigin,
        priority: u8,
        handler: Option<Box<dyn TransactionHandler>>,
    ) {
        let send_window = if self.codec.supports_stream_multiplexing() {
            self.remote_initial_window
        } else {
            u32::MAX >> 1
        };
        let mut txn = Transaction::new(
            id,
            origin,
            priority,
            send_window,
            self.config.receive_stream_window_size,
        );
        let has_handler = handler.is_some();
        txn.handler = handler;
        let was_empty = self.transactions.is_empty();
        self.transactions.insert(id, txn);

        if origin.locally_initiated() {
            self.outgoing_streams += 1;
        } else {
            self.incoming_streams += 1;
            self.highest_incoming_stream = Some(match self.highest_incoming_stream {
                Some(prev) => prev.max(id),
                None => id,
            });
        }
        if matches!(
            origin,
            TxnOrigin::PushedLocal { .. } | TxnOrigin::PushedRemote { .. }
        ) {
            self.pushed_txns += 1;
        }
        metrics::TRANSACTIONS_OPENED.increment();
        if was_empty && let Some(info) = self.info.as_deref_mut() {
            info.on_activate_connection();
        }
        self.update_streams_full_state();

        // Grow the stream receive window past the advertised initial.
        if self.codec.supports_stream_multiplexing()
            && self.config.receive_stream_window_size > self.config.initial_receive_window
        {
            let delta =
                self.config.receive_stream_window_size - self.config.initial_receive_window;
            let res = self
                .codec
                .generate_window_update(&mut self.write_buf, id, delta);
            self.note_encoded_lossy(res);
            self.schedule_write();
        }

        if has_handler {
            self.deliver(id, |h, ctx| h.on_attached(ctx));
        }
    }

    fn on_headers_complete(&mut self, id: StreamId, msg: Message) {
        let now = Instant::now();
        let Some(txn) = self.transactions.get_mut(&id) else {
            self.invalid_stream(id);
            return;
        };
        if txn.ingress_started {
            // Duplicate head from the codec; the first one won.
            return;
        }
        txn.ingress_started = true;
        txn.touch(now);
        let needs_handler = txn.handler.is_none() && !txn.detached;
        if let Some(info) = self.info.as_deref_mut() {
            info.on_ingress_message(&msg);
        }

        if needs_handler {
            // Downstream attach point: the controller produces the handler
            // now that the request head is known.
            let handler = self
                .controller
                .get_request_handler(&msg)
                .unwrap_or_else(|| Box::new(DirectResponseHandler::with_status(500)));
            if let Some(txn) = self.transactions.get_mut(&id) {
                txn.handler = Some(handler);
            }
            self.deliver(id, |h, ctx| h.on_attached(ctx));
        }
        self.deliver(id, move |h, ctx| h.on_headers_complete(ctx, msg));
    }

    fn on_body(&mut self, id: StreamId, chunk: Bytes) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            self.invalid_stream(id);
            return;
        };
        txn.touch(Instant::now());
        txn.buffered_ingress_bytes += chunk.len();
        self.pending_read_size += chunk.len();
        self.max_ingress_buffered = self.max_ingress_buffered.max(self.pending_read_size);
        if txn.ingress_paused {
            txn.deferred_ingress.push_back(IngressEvent::Body(chunk));
        } else {
            self.deliver(id, move |h, ctx| h.on_body(ctx, chunk));
        }
    }

    fn on_ingress_event(&mut self, id: StreamId, event: IngressEvent) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            self.invalid_stream(id);
            return;
        };
        txn.touch(Instant::now());
        if txn.ingress_paused {
            txn.deferred_ingress.push_back(event);
            return;
        }
        self.deliver_ingress_event(id, event);
    }

    fn deliver_ingress_event(&mut self, id: StreamId, event: IngressEvent) {
        match event {
            IngressEvent::Body(chunk) => {
                self.deliver(id, move |h, ctx| h.on_body(ctx, chunk));
            }
            IngressEvent::ChunkHeader(length) => {
                self.deliver(id, move |h, ctx| h.on_chunk_header(ctx, length));
            }
            IngressEvent::ChunkComplete => {
                self.deliver(id, |h, ctx| h.on_chunk_complete(ctx));
            }
            IngressEvent::Trailers(trailers) => {
                self.deliver(id, move |h, ctx| h.on_trailers(ctx, trailers));
            }
            IngressEvent::MessageComplete { upgrade } => {
                if let Some(txn) = self.transactions.get_mut(&id) {
                    txn.close_ingress();
                }
                let max_queue = self.max_ingress_buffered;
                if let Some(info) = self.info.as_deref_mut() {
                    info.on_request_end(max_queue);
                }
                if upgrade {
                    self.deliver(id, |h, ctx| h.on_upgrade(ctx));
                }
                self.deliver(id, |h, ctx| h.on_eom(ctx));
                self.maybe_remove(id);
            }
            IngressEvent::Error(error) => {
                if let Some(txn) = self.transactions.get_mut(&id) {
                    txn.close_ingress();
                }
                self.deliver(id, move |h, ctx| h.on_error(ctx, error));
                self.maybe_remove(id);
            }
            IngressEvent::Abort(code) => {
                self.finish_aborted_txn(id, code);
            }
        }
    }

    fn on_parse_error(&mut self, stream_id: Option<StreamId>, error: CodecError, new_txn: bool) {
        let Some(id) = stream_id else {
            self.on_session_parse_error(error);
            return;
        };
        warn!(stream = %id, error = %error, "stream parse error");
        if self.transactions.contains_key(&id) {
            let err = Error::Parse(error);
            if let Some(info) = self.info.as_deref_mut() {
                info.on_ingress_error(&err);
            }
            self.on_ingress_event(id, IngressEvent::Error(err));
        } else if new_txn {
            // The error arrived on a brand-new stream: admit it just far
            // enough to answer with a direct error response.
            self.admit_transaction(id, TxnOrigin::Incoming, 0, None);
            self.handle_error_directly(id, Error::Parse(error));
        } else {
            self.on_new_transaction_parse_error(id, error);
        }
    }

    /// Stream-scoped error on a stream we will not admit: reset it at the
    /// codec level and move on.
    fn on_new_transaction_parse_error(&mut self, id: StreamId, error: CodecError) {
        debug!(stream = %id, error = %error, "refusing unparseable new stream");
        self.note_reset(id);
        let res = self
            .codec
            .generate_rst_stream(&mut self.write_buf, id, error.code);
        self.note_encoded_lossy(res);
        self.schedule_write();
    }

    /// A parse error that poisons the whole session: abort everything,
    /// say goodbye, and stop reading.
    fn on_session_parse_error(&mut self, error: CodecError) {
        if self.phase.ingress_error {
            return;
        }
        warn!(error = %error, "session parse error");
        self.phase.ingress_error = true;
        self.set_close_reason(ConnectionCloseReason::SessionParseError);
        let err = Error::Parse(error.clone());
        if let Some(info) = self.info.as_deref_mut() {
            info.on_ingress_error(&err);
        }
        let ack = self.graceful_goaway_ack();
        self.send_goaway_frame(ack, error.code);
        let ids = self.snapshot_ids();
        self.mass_error(ids, &err, false);
        self.phase.writes_draining = true;
        self.shutdown_transport_impl(true, false);
        self.try_finish_write_drain();
    }

    /// Install a direct-response handler on a transaction with no
    /// application handler and feed it the error.
    fn handle_error_directly(&mut self, id: StreamId, error: Error) {
        let handler = self
            .controller
            .get_parse_error_handler(&error)
            .unwrap_or_else(|| Box::new(DirectResponseHandler::from_error()));
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.handler = Some(handler);
            txn.close_ingress();
        }
        self.deliver(id, move |h, ctx| h.on_error(ctx, error));
        self.maybe_remove(id);
    }

    fn on_ingress_abort(&mut self, id: StreamId, code: ErrorCode) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        if txn.ingress_paused {
            txn.deferred_ingress.push_back(IngressEvent::Abort(code));
            return;
        }
        self.finish_aborted_txn(id, code);
    }

    fn finish_aborted_txn(&mut self, id: StreamId, code: ErrorCode) {
        metrics::TRANSACTIONS_ABORTED.increment();
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.close_ingress();
            txn.close_egress();
            txn.aborted = true;
            txn.pending_egress.clear();
            txn.pending_egress_bytes = 0;
            if txn.enqueued {
                let priority = txn.priority();
                txn.enqueued = false;
                self.egress_queue.remove(id, priority);
            }
        }
        self.deliver(id, move |h, ctx| h.on_abort(ctx, code));
        self.maybe_remove(id);
    }

    fn on_goaway(&mut self, last_good: StreamId, code: ErrorCode) {
        debug!(last_good = %last_good, code = %code, "GOAWAY received");
        self.set_close_reason(ConnectionCloseReason::GoawayReceived);
        self.phase.draining = true;
        // Streams past the peer's ack were never processed; error them so
        // callers can retry elsewhere.
        let affected: Vec<StreamId> = self
            .transactions
            .values()
            .filter(|t| t.origin().locally_initiated() && t.id() > last_good)
            .map(|t| t.id())
            .collect();
        self.mass_error(affected, &Error::StreamRefused, false);
        if self.transactions.is_empty() && self.direction == TransportDirection::Upstream {
            self.shutdown_transport_impl(true, true);
        }
    }

    fn on_ping_request(&mut self, id: u64) {
        let res = self.codec.generate_ping_reply(&mut self.write_buf, id);
        if let Ok(n) = self.note_encoded(res)
            && n > 0
        {
            self.byte_events.add(ByteEvent {
                offset: self.bytes_scheduled,
                kind: ByteEventKind::PingReply { id },
                stream_id: None,
            });
            self.schedule_write();
        }
    }

    fn on_ping_reply(&mut self, _id: u64) {
        if let Some((_, sent_at)) = self.outstanding_pings.pop_front() {
            let latency = sent_at.elapsed();
            trace!(latency_ns = latency.as_nanos() as u64, "ping reply");
            if let Some(info) = self.info.as_deref_mut() {
                info.on_ping_reply(latency.as_nanos() as u64);
            }
        }
    }

    fn on_window_update(&mut self, id: StreamId, delta: u32) {
        if !self.codec.supports_stream_multiplexing() {
            return;
        }
        if id.is_connection_level() {
            if self.conn_send_window.grant(delta) {
                self.on_connection_send_window_open();
            }
            self.schedule_write();
            return;
        }
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        txn.send_window.grant(delta);
        let resumable = txn.egress_paused && txn.send_window.is_open();
        let wants_queue = txn.has_pending_egress() && !txn.enqueued;
        if resumable {
            self.resume_txn_egress(id);
        } else if wants_queue {
            self.enqueue_txn(id);
        }
        self.schedule_write();
    }

    /// The session send window reopened: every transaction with pending
    /// egress goes back in the queue.
    fn on_connection_send_window_open(&mut self) {
        trace!("connection send window open");
        let ids: Vec<StreamId> = self
            .transactions
            .values()
            .filter(|t| t.has_pending_egress())
            .map(|t| t.id())
            .collect();
        for id in ids {
            let Some(txn) = self.transactions.get(&id) else {
                continue;
            };
            if txn.egress_paused && txn.send_window.is_open() {
                self.resume_txn_egress(id);
            } else if !txn.enqueued {
                self.enqueue_txn(id);
            }
        }
        self.schedule_write();
    }

    fn on_settings(&mut self, settings: Vec<Setting>) {
        for setting in settings {
            match setting.id {
                SettingId::MaxConcurrentStreams => {
                    self.max_outgoing_remote = setting.value;
                    self.update_streams_full_state();
                }
                SettingId::InitialWindowSize => {
                    let delta = setting.value as i32 - self.remote_initial_window as i32;
                    self.remote_initial_window = setting.value;
                    let ids: Vec<StreamId> = self.transactions.keys().copied().collect();
                    for id in ids {
                        let Some(txn) = self.transactions.get_mut(&id) else {
                            continue;
                        };
                        txn.send_window.resize(delta);
                        if delta > 0
                            && txn.has_pending_egress()
                            && txn.egress_paused
                            && txn.send_window.is_open()
                        {
                            self.resume_txn_egress(id);
                        }
                    }
                    if delta > 0 {
                        self.schedule_write();
                    }
                }
                _ => {}
            }
        }
    }

    /// Codec callbacks for a stream we are not tracking.
    fn invalid_stream(&mut self, id: StreamId) {
        if self.was_recently_reset(id) {
            return;
        }
        trace!(stream = %id, "event for untracked stream");
        self.note_reset(id);
        if self.codec.supports_stream_reset() {
            let res =
                self.codec
                    .generate_rst_stream(&mut self.write_buf, id, ErrorCode::StreamClosed);
            self.note_encoded_lossy(res);
            self.schedule_write();
        }
    }

    /// Refuse a stream at admission without creating a transaction.
    fn refuse_stream(&mut self, id: StreamId) {
        debug!(stream = %id, "refusing stream");
        metrics::TRANSACTIONS_REFUSED.increment();
        self.note_reset(id);
        if self.codec.supports_stream_reset() {
            let res = self.codec.generate_rst_stream(
                &mut self.write_buf,
                id,
                ErrorCode::RefusedStream,
            );
            self.note_encoded_lossy(res);
            self.schedule_write();
        }
    }

    /// Remember a stream whose reset is on the wire so trailing ingress
    /// for it is absorbed silently.
    fn note_reset(&mut self, id: StreamId) {
        if self.recently_reset.len() >= 16 {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(id);
    }

    fn was_recently_reset(&self, id: StreamId) -> bool {
        self.recently_reset.contains(&id)
    }

    // === Read backpressure ===

    fn check_read_backpressure(&mut self) {
        if self.pending_read_size > self.config.read_buf_limit {
            self.pause_reads();
        }
    }

    fn pause_reads(&mut self) {
        if self.phase.reads != IoState::Open {
            return;
        }
        debug!(
            buffered = self.pending_read_size,
            limit = self.config.read_buf_limit,
            "pausing reads"
        );
        self.phase.reads = IoState::Paused;
        self.transport.pause_reads();
        metrics::INGRESS_LIMIT_EXCEEDED.increment();
        if let Some(info) = self.info.as_deref_mut() {
            info.on_ingress_paused();
            info.on_ingress_limit_exceeded();
        }
    }

    fn resume_reads(&mut self) {
        if self.phase.reads != IoState::Paused {
            return;
        }
        debug!("resuming reads");
        self.phase.reads = IoState::Open;
        self.transport.resume_reads();
    }

    /// Buffered ingress body was consumed for a transaction. Shrinks the
    /// aggregate counter, returns flow control credit to the peer, and
    /// resumes transport reads once back under the limit.
    pub fn notify_ingress_body_processed(&mut self, id: StreamId, bytes: usize) {
        self.pending_read_size = self.pending_read_size.saturating_sub(bytes);
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.buffered_ingress_bytes = txn.buffered_ingress_bytes.saturating_sub(bytes);
        }
        if self.codec.supports_stream_multiplexing() {
            // Return credit to the peer once enough has been consumed.
            let stream_grant = self
                .transactions
                .get_mut(&id)
                .and_then(|txn| txn.recv_window.on_consumed(bytes as u32));
            if let Some(grant) = stream_grant {
                let res = self
                    .codec
                    .generate_window_update(&mut self.write_buf, id, grant);
                self.note_encoded_lossy(res);
                self.schedule_write();
            }
            if let Some(grant) = self.conn_recv_window.on_consumed(bytes as u32) {
                let res = self.codec.generate_window_update(
                    &mut self.write_buf,
                    StreamId::CONNECTION,
                    grant,
                );
                self.note_encoded_lossy(res);
                self.schedule_write();
            }
        }
        if self.pending_read_size < self.config.read_buf_limit {
            self.resume_reads();
        }
    }

    /// Suspend ingress delivery to one transaction's handler. Events
    /// queue up and keep counting toward the read buffer limit.
    pub fn pause_ingress(&mut self, id: StreamId) {
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.ingress_paused = true;
        }
    }

    /// Resume ingress delivery, draining deferred events in FIFO order.
    pub fn resume_ingress(&mut self, id: StreamId) {
        {
            let Some(txn) = self.transactions.get_mut(&id) else {
                return;
            };
            if !txn.ingress_paused {
                return;
            }
            txn.ingress_paused = false;
        }
        // Deferred events drain in FIFO order; the handler may re-pause
        // mid-drain.
        loop {
            let event = {
                let Some(txn) = self.transactions.get_mut(&id) else {
                    return;
                };
                if txn.ingress_paused {
                    return;
                }
                match txn.deferred_ingress.pop_front() {
                    Some(event) => event,
                    None => break,
                }
            };
            self.deliver_ingress_event(id, event);
        }
    }

    // === Egress: handler send surface ===

    pub(crate) fn send_headers(&mut self, id: StreamId, msg: &Message) -> Result<usize, Error> {
        self.check_sendable(id)?;
        let assoc = match self.transactions.get(&id).map(|t| t.origin()) {
            Some(TxnOrigin::PushedLocal { assoc }) => Some(assoc),
            _ => None,
        };
        let first_headers = self
            .transactions
            .get(&id)
            .is_some_and(|t| !t.headers_sent);
        let res = match assoc {
            // The first head on a locally-pushed stream rides in a push
            // promise on the associated stream.
            Some(assoc) if first_headers => {
                self.codec
                    .generate_push_promise(&mut self.write_buf, assoc, id, msg)
            }
            _ => self
                .codec
                .generate_headers(&mut self.write_buf, id, msg, false),
        };
        let n = self.note_encoded(res)?;
        if let Some(txn) = self.transactions.get_mut(&id) {
            if !txn.headers_sent {
                txn.headers_sent = true;
                self.byte_events.add(ByteEvent {
                    offset: self.bytes_scheduled,
                    kind: ByteEventKind::FirstHeaderByte,
                    stream_id: Some(id),
                });
            }
            txn.touch(Instant::now());
        }
        self.schedule_write();
        Ok(n)
    }

    pub(crate) fn send_body(
        &mut self,
        id: StreamId,
        body: Bytes,
        include_eom: bool,
    ) -> Result<usize, Error> {
        self.check_sendable(id)?;
        let Some(txn) = self.transactions.get_mut(&id) else {
            return Err(Error::SessionClosed);
        };
        txn.queue_egress(EgressPiece::Body {
            chunk: body,
            eom: include_eom,
        });
        if include_eom {
            txn.egress_state = HalfState::EomQueued;
        }
        txn.touch(Instant::now());
        self.notify_pending_egress(id);
        Ok(0)
    }

    pub(crate) fn send_chunk_header(&mut self, id: StreamId, length: usize) -> Result<usize, Error> {
        self.check_sendable(id)?;
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.queue_egress(EgressPiece::ChunkHeader { length });
        }
        self.notify_pending_egress(id);
        Ok(0)
    }

    pub(crate) fn send_chunk_terminator(&mut self, id: StreamId) -> Result<usize, Error> {
        self.check_sendable(id)?;
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.queue_egress(EgressPiece::ChunkTerminator);
        }
        self.notify_pending_egress(id);
        Ok(0)
    }

    pub(crate) fn send_trailers(
        &mut self,
        id: StreamId,
        trailers: Vec<HeaderField>,
    ) -> Result<usize, Error> {
        self.check_sendable(id)?;
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.queue_egress(EgressPiece::Trailers(trailers));
        }
        self.notify_pending_egress(id);
        Ok(0)
    }

    pub(crate) fn send_eom(&mut self, id: StreamId) -> Result<usize, Error> {
        self.check_sendable(id)?;
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.queue_egress(EgressPiece::Eom);
            txn.egress_state = HalfState::EomQueued;
            txn.touch(Instant::now());
        }
        self.notify_pending_egress(id);
        Ok(0)
    }

    pub(crate) fn send_abort(&mut self, id: StreamId, code: ErrorCode) -> Result<usize, Error> {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return Err(Error::SessionClosed);
        };
        if txn.aborted {
            return Ok(0);
        }
        txn.aborted = true;
        txn.close_ingress();
        txn.close_egress();
        txn.pending_egress.clear();
        txn.pending_egress_bytes = 0;
        if txn.enqueued {
            let priority = txn.priority();
            txn.enqueued = false;
            self.egress_queue.remove(id, priority);
        }
        metrics::TRANSACTIONS_ABORTED.increment();
        // Queued peer bytes for this stream may still arrive; absorb them.
        self.note_reset(id);

        if self.codec.supports_stream_reset() {
            let res = self
                .codec
                .generate_rst_stream(&mut self.write_buf, id, code);
            let n = self.note_encoded(res)?;
            self.schedule_write();
            self.maybe_remove(id);
            Ok(n)
        } else {
            // Reset without stream framing means dropping the connection.
            self.maybe_remove(id);
            self.shutdown_transport_impl(true, true);
            Ok(0)
        }
    }

    pub(crate) fn send_stream_window_update(
        &mut self,
        id: StreamId,
        bytes: u32,
    ) -> Result<usize, Error> {
        if !self.transactions.contains_key(&id) {
            return Err(Error::SessionClosed);
        }
        let res = self
            .codec
            .generate_window_update(&mut self.write_buf, id, bytes);
        let n = self.note_encoded(res)?;
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.recv_window.grant_extra(bytes);
        }
        self.schedule_write();
        Ok(n)
    }

    pub(crate) fn notify_pending_egress(&mut self, id: StreamId) {
        let Some(txn) = self.transactions.get(&id) else {
            return;
        };
        if txn.egress_paused || txn.enqueued || !txn.has_pending_egress() {
            if txn.has_pending_egress() {
                self.schedule_write();
            }
            return;
        }
        self.enqueue_txn(id);
        self.schedule_write();
    }

    pub(crate) fn detach(&mut self, id: StreamId) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        txn.detached = true;
        txn.handler = None;
        self.maybe_remove(id);
    }

    fn check_sendable(&self, id: StreamId) -> Result<(), Error> {
        if self.phase.destroyed || self.phase.writes.is_shutdown() {
            return Err(Error::SessionClosed);
        }
        match self.transactions.get(&id) {
            Some(txn) if txn.egress_state == HalfState::Open => Ok(()),
            Some(_) => Err(Error::SessionClosed),
            None => Err(Error::SessionClosed),
        }
    }

    // === Egress: scheduler ===

    fn schedule_write(&mut self) {
        if !self.phase.writes.is_shutdown() && !self.phase.destroyed {
            self.phase.write_scheduled = true;
        }
    }

    /// Whether the driver should invoke [`run_loop_callback`] at the end
    /// of the current event loop turn.
    pub fn wants_write_callback(&self) -> bool {
        self.phase.write_scheduled
    }

    /// End-of-loop write callback: drain ready transactions into the
    /// codec and submit at most one transport write.
    pub fn run_loop_callback(&mut self) {
        if self.phase.destroyed || self.phase.in_loop_callback {
            return;
        }
        self.phase.in_loop_callback = true;
        self.phase.write_scheduled = false;
        self.turn_last_eom = None;

        // Fill: serve the queue in priority order until the turn's cap.
        while !self.egress_limit_exceeded()
            && !self.phase.writes.is_shutdown()
            && !self.phase.destroyed
        {
            let Some(id) = self.next_ready_txn() else {
                break;
            };
            self.serve_txn(id);
        }

        self.submit_write_buf();
        self.phase.in_loop_callback = false;

        // Anything left runs next turn.
        if self.has_queued_egress() {
            self.schedule_write();
        }
        self.try_finish_write_drain();
        self.check_for_shutdown();
    }

    fn has_queued_egress(&self) -> bool {
        !self.write_buf.is_empty() || !self.egress_queue.is_empty()
    }

    fn egress_limit_exceeded(&self) -> bool {
        let unwritten = self
            .pending_write_size
            .max(self.transport.pending_write_bytes());
        unwritten + self.write_buf.len() >= self.config.pending_write_max
    }

    fn next_ready_txn(&mut self) -> Option<StreamId> {
        loop {
            let (id, _) = self.egress_queue.pop()?;
            if let Some(txn) = self.transactions.get_mut(&id) {
                txn.enqueued = false;
                if txn.has_pending_egress() {
                    return Some(id);
                }
            }
        }
    }

    /// Serialize up to one quantum of this transaction's queued egress.
    fn serve_txn(&mut self, id: StreamId) {
        enum Action {
            Body { slice: Bytes, fin: bool },
            ChunkHeader(usize),
            ChunkTerminator,
            Trailers(Vec<HeaderField>),
            Eom,
            Skip,
            Blocked,
            Done,
        }

        let quantum = self.config.egress_body_quantum;
        let multiplexed = self.codec.supports_stream_multiplexing();
        let mut spent = 0usize;

        loop {
            let action = {
                let conn_window = if multiplexed {
                    self.conn_send_window.available()
                } else {
                    i32::MAX
                };
                let Some(txn) = self.transactions.get_mut(&id) else {
                    return;
                };
                if spent >= quantum || txn.pending_egress.is_empty() {
                    Action::Done
                } else if matches!(txn.pending_egress.front(), Some(EgressPiece::Body { .. })) {
                    let window = conn_window.min(txn.send_window.available());
                    let head_empty = matches!(
                        txn.pending_egress.front(),
                        Some(EgressPiece::Body { chunk, .. }) if chunk.is_empty()
                    );
                    if head_empty {
                        // A zero-length body piece is an EOM marker or a no-op.
                        match txn.pending_egress.pop_front() {
                            Some(EgressPiece::Body { eom: true, .. }) => Action::Eom,
                            _ => Action::Skip,
                        }
                    } else if window <= 0 {
                        Action::Blocked
                    } else if let Some(EgressPiece::Body { chunk, eom }) =
                        txn.pending_egress.front_mut()
                    {
                        let allow = (window as usize).min(quantum - spent).min(chunk.len());
                        let slice = chunk.split_to(allow);
                        let fin = chunk.is_empty() && *eom;
                        let drained = chunk.is_empty();
                        if drained {
                            txn.pending_egress.pop_front();
                        }
                        Action::Body { slice, fin }
                    } else {
                        Action::Skip
                    }
                } else {
                    match txn.pending_egress.pop_front() {
                        Some(EgressPiece::ChunkHeader { length }) => Action::ChunkHeader(length),
                        Some(EgressPiece::ChunkTerminator) => Action::ChunkTerminator,
                        Some(EgressPiece::Trailers(trailers)) => Action::Trailers(trailers),
                        Some(EgressPiece::Eom) => Action::Eom,
                        _ => Action::Done,
                    }
                }
            };

            match action {
                Action::Done => break,
                Action::Skip => continue,
                Action::Blocked => {
                    self.pause_txn_egress(id);
                    return;
                }
                Action::Body { slice, fin } => {
                    let res = self
                        .codec
                        .generate_body(&mut self.write_buf, id, &slice, fin);
                    if self.note_encoded(res).is_err() {
                        return;
                    }
                    let body_len = slice.len();
                    spent += body_len;
                    if multiplexed {
                        self.conn_send_window.spend(body_len as u32);
                    }
                    if let Some(txn) = self.transactions.get_mut(&id) {
                        txn.send_window.spend(body_len as u32);
                        txn.pending_egress_bytes =
                            txn.pending_egress_bytes.saturating_sub(body_len);
                        txn.touch(Instant::now());
                        if fin {
                            txn.egress_state = HalfState::EomSent;
                        }
                    }
                    if fin {
                        self.register_last_byte_event(id);
                        break;
                    }
                }
                Action::ChunkHeader(length) => {
                    let res =
                        self.codec
                            .generate_chunk_header(&mut self.write_buf, id, length);
                    match self.note_encoded(res) {
                        Ok(n) => spent += n,
                        Err(_) => return,
                    }
                }
                Action::ChunkTerminator => {
                    let res = self.codec.generate_chunk_terminator(&mut self.write_buf, id);
                    match self.note_encoded(res) {
                        Ok(n) => spent += n,
                        Err(_) => return,
                    }
                }
                Action::Trailers(trailers) => {
                    let res =
                        self.codec
                            .generate_trailers(&mut self.write_buf, id, &trailers);
                    match self.note_encoded(res) {
                        Ok(n) => spent += n,
                        Err(_) => return,
                    }
                }
                Action::Eom => {
                    let res = self.codec.generate_eom(&mut self.write_buf, id);
                    if self.note_encoded(res).is_err() {
                        return;
                    }
                    if let Some(txn) = self.transactions.get_mut(&id) {
                        txn.egress_state = HalfState::EomSent;
                    }
                    self.register_last_byte_event(id);
                    break;
                }
            }
        }

        // Round-robin: a transaction with more to send rejoins its band
        // at the tail.
        let (requeue, blocked) = match self.transactions.get(&id) {
            Some(txn) => (
                txn.has_pending_egress(),
                txn.egress_blocked_on_window()
                    || (multiplexed
                        && !self.conn_send_window.is_open()
                        && matches!(
                            txn.pending_egress.front(),
                            Some(EgressPiece::Body { chunk, .. }) if !chunk.is_empty()
                        )),
            ),
            None => (false, false),
        };
        if blocked {
            self.pause_txn_egress(id);
        } else if requeue {
            self.enqueue_txn(id);
        }
    }

    fn register_last_byte_event(&mut self, id: StreamId) {
        self.byte_events.add(ByteEvent {
            offset: self.bytes_scheduled,
            kind: ByteEventKind::LastByte,
            stream_id: Some(id),
        });
        self.turn_last_eom = Some(self.bytes_scheduled);
    }

    fn submit_write_buf(&mut self) {
        if self.write_buf.is_empty() || self.phase.writes.is_shutdown() {
            return;
        }
        let data = self.write_buf.split().freeze();
        let len = data.len();
        // Cork when this turn left more egress behind; EOR when the
        // buffer ends exactly at a message's last byte.
        let cork = !self.egress_queue.is_empty();
        let eor = self.turn_last_eom == Some(self.bytes_scheduled);
        let flags = WriteFlags::new(cork, eor);

        trace!(len, cork, eor, "submitting write");
        match self.transport.submit_write(data, flags) {
            Ok(()) => {
                self.pending_writes.push(WriteSegment::new(len as u64, flags));
                self.num_active_writes += 1;
                self.pending_write_size += len;
                self.timeouts.on_write_submitted(Instant::now());
                self.update_egress_backpressure();
            }
            Err(err) => {
                self.on_write_error(err);
            }
        }
    }

    fn enqueue_txn(&mut self, id: StreamId) {
        if let Some(txn) = self.transactions.get_mut(&id)
            && !txn.enqueued
            && txn.has_pending_egress()
        {
            txn.enqueued = true;
            let priority = txn.priority();
            self.egress_queue.push(id, priority);
        }
    }

    fn pause_txn_egress(&mut self, id: StreamId) {
        let newly_paused = match self.transactions.get_mut(&id) {
            Some(txn) if !txn.egress_paused => {
                txn.egress_paused = true;
                true
            }
            _ => false,
        };
        if newly_paused {
            self.deliver(id, |h, ctx| h.on_egress_paused(ctx));
        }
    }

    fn resume_txn_egress(&mut self, id: StreamId) {
        let resumed = match self.transactions.get_mut(&id) {
            Some(txn) if txn.egress_paused => {
                txn.egress_paused = false;
                true
            }
            _ => false,
        };
        if resumed {
            self.deliver(id, |h, ctx| h.on_egress_resumed(ctx));
            self.enqueue_txn(id);
        }
    }

    /// Pause or resume all transactions' egress as the unwritten-byte cap
    /// is crossed.
    fn update_egress_backpressure(&mut self) {
        let over = self
            .pending_write_size
            .max(self.transport.pending_write_bytes())
            >= self.config.pending_write_max;
        match self.phase.writes {
            IoState::Open if over => {
                debug!(pending = self.pending_write_size, "egress paused");
                self.phase.writes = IoState::Paused;
                metrics::EGRESS_PAUSED.increment();
                let ids = self.snapshot_ids();
                for id in ids {
                    self.pause_txn_egress(id);
                }
            }
            IoState::Paused if !over => {
                debug!("egress resumed");
                self.phase.writes = IoState::Open;
                let ids = self.snapshot_ids();
                for id in ids {
                    let window_blocked = self
                        .transactions
                        .get(&id)
                        .is_some_and(|t| t.egress_blocked_on_window());
                    if !window_blocked {
                        self.resume_txn_egress(id);
                    }
                }
            }
            _ => {}
        }
    }

    // === Write completion ===

    /// Transport write callback: the oldest in-flight write finished.
    pub fn on_write_success(&mut self) {
        if self.phase.destroyed {
            return;
        }
        let Some(segment) = self.pending_writes.pop() else {
            return;
        };
        let len = segment.length();
        self.num_active_writes = self.num_active_writes.saturating_sub(1);
        self.bytes_written += len;
        self.pending_write_size = self.pending_write_size.saturating_sub(len as usize);
        metrics::BYTES_WRITTEN.add(len);
        if let Some(info) = self.info.as_deref_mut() {
            info.on_write(len as usize);
        }
        self.timeouts
            .on_write_completed(Instant::now(), self.num_active_writes > 0);

        self.process_byte_events();
        self.update_egress_backpressure();
        self.on_write_completed();
        self.check_for_shutdown();
    }

    fn process_byte_events(&mut self) {
        let mut fired = mem::take(&mut self.fired_events);
        fired.clear();
        self.byte_events.process(self.bytes_written, &mut fired);
        for event in fired.drain(..) {
            match event.kind {
                ByteEventKind::LastByte => {
                    if let Some(id) = event.stream_id {
                        if let Some(txn) = self.transactions.get_mut(&id) {
                            txn.close_egress();
                        }
                        self.on_egress_message_finished(id);
                    }
                }
                ByteEventKind::FirstHeaderByte => {
                    trace!(stream = ?event.stream_id, offset = event.offset, "first header byte");
                }
                ByteEventKind::PingReply { id } => {
                    trace!(ping = id, offset = event.offset, "ping reply written");
                }
            }
        }
        self.fired_events = fired;
    }

    /// The egress half finished cleanly.
    fn on_egress_message_finished(&mut self, id: StreamId) {
        self.maybe_remove(id);
        // A codec that cannot serve another message (e.g. HTTP/1.1 with
        // connection close) drains the session after its message.
        if !self.codec.is_reusable() && !self.phase.writes_draining {
            self.phase.draining = true;
            self.phase.writes_draining = true;
            self.try_finish_write_drain();
        }
    }

    fn on_write_completed(&mut self) {
        if self.phase.reset_after_draining_writes && self.num_active_writes == 0 {
            debug!("draining writes complete, resetting");
            self.finish_writes_shutdown();
            self.transport.close_with_reset();
            return;
        }
        self.try_finish_write_drain();
        if self.has_more_writes() && !self.phase.writes.is_shutdown() {
            self.schedule_write();
        }
    }

    /// Transport write callback: a write failed. Session-fatal for the
    /// write side.
    pub fn on_write_error(&mut self, err: io::Error) {
        if self.phase.destroyed || self.phase.writes.is_shutdown() {
            return;
        }
        warn!(error = %err, "write error");
        self.set_close_reason(ConnectionCloseReason::IoWriteError);
        let error = Error::WriteFailed(err);
        self.finish_writes_shutdown();
        let dropped = self.byte_events.drain();
        if !dropped.is_empty() {
            trace!(count = dropped.len(), "dropping byte events");
        }
        let ids = self.snapshot_ids();
        self.mass_error(ids, &error, true);
        self.transport.shutdown_writes();
        self.check_for_shutdown();
    }

    /// Clear all egress state and mark the write side shut. Upholds the
    /// invariant that a shut write side has no active writes and an empty
    /// queue.
    fn finish_writes_shutdown(&mut self) {
        self.phase.writes = IoState::Shutdown;
        self.phase.write_scheduled = false;
        self.egress_queue.clear();
        self.write_buf.clear();
        self.pending_writes.detach_all();
        self.num_active_writes = 0;
        self.pending_write_size = 0;
    }

    fn has_more_writes(&self) -> bool {
        self.num_active_writes > 0 || !self.write_buf.is_empty() || !self.egress_queue.is_empty()
    }

    // === Shutdown state machine ===

    /// Stop admitting transactions and announce drain to the peer.
    /// Existing transactions run to completion. Idempotent.
    pub fn drain(&mut self) {
        if self.phase.goaway_final_sent || self.phase.destroyed {
            return;
        }
        debug!("draining session");
        self.phase.draining = true;
        self.phase.goaway_final_sent = true;
        self.set_close_reason(ConnectionCloseReason::ShutdownRequested);
        let ack = self.graceful_goaway_ack();
        self.send_goaway_frame(ack, ErrorCode::NoError);
        if self.transactions.is_empty() && self.direction == TransportDirection::Upstream {
            self.shutdown_transport_impl(true, true);
        }
    }

    /// First-phase drain: advertise shutdown without committing to a
    /// final stream id, when the codec supports a two-phase GOAWAY.
    pub fn notify_pending_shutdown(&mut self) {
        if self.phase.destroyed || self.phase.draining {
            return;
        }
        if self.codec.supports_two_phase_drain() {
            debug!("soft drain");
            self.phase.draining = true;
            self.set_close_reason(ConnectionCloseReason::ShutdownRequested);
            self.send_goaway_frame(StreamId::MAX, ErrorCode::NoError);
        } else {
            self.drain();
        }
    }

    /// Drain, then shut the write side once every transaction and queued
    /// write has finished.
    pub fn close_when_idle(&mut self) {
        if self.phase.destroyed {
            return;
        }
        debug!("close when idle");
        self.phase.writes_draining = true;
        self.drain();
        self.try_finish_write_drain();
    }

    fn try_finish_write_drain(&mut self) {
        if self.phase.writes_draining
            && !self.phase.writes.is_shutdown()
            && self.transactions.is_empty()
            && !self.has_more_writes()
        {
            self.shutdown_transport_impl(false, true);
        }
    }

    /// Half-close the transport. Transactions whose corresponding half is
    /// incomplete receive an error. Idempotent per direction.
    pub fn shutdown_transport(&mut self, shutdown_reads: bool, shutdown_writes: bool) {
        self.shutdown_transport_impl(shutdown_reads, shutdown_writes);
    }

    fn shutdown_transport_impl(&mut self, shutdown_reads: bool, shutdown_writes: bool) {
        if self.phase.destroyed {
            return;
        }
        let shut_reads = shutdown_reads && !self.phase.reads.is_shutdown();
        let shut_writes = shutdown_writes && !self.phase.writes.is_shutdown();
        if !shut_reads && !shut_writes {
            self.check_for_shutdown();
            return;
        }
        debug!(reads = shut_reads, writes = shut_writes, "shutting down transport");
        self.set_close_reason(ConnectionCloseReason::ShutdownRequested);
        self.phase.draining = true;

        let affected: Vec<StreamId> = self
            .transactions
            .values()
            .filter(|t| {
                (shut_reads && !t.ingress_state.is_closed())
                    || (shut_writes && !t.egress_state.is_closed())
            })
            .map(|t| t.id())
            .collect();
        self.mass_error(affected, &Error::Dropped, false);

        if shut_reads {
            self.phase.reads = IoState::Shutdown;
            self.transport.shutdown_reads();
        }
        if shut_writes {
            self.finish_writes_shutdown();
            self.transport.shutdown_writes();
        }
        self.check_for_shutdown();
    }

    /// Abort everything and reset the peer, discarding queued writes. If
    /// writes are already in flight the reset waits for their
    /// completions.
    pub fn shutdown_transport_with_reset(&mut self, err: Error) {
        if self.phase.destroyed {
            return;
        }
        debug!(error = %err, "reset shutdown");
        self.set_close_reason(ConnectionCloseReason::Dropped);
        self.phase.draining = true;
        let ids = self.snapshot_ids();
        self.mass_error(ids, &err, true);

        self.egress_queue.clear();
        self.write_buf.clear();
        self.phase.write_scheduled = false;
        let dropped = self.byte_events.drain();
        if !dropped.is_empty() {
            trace!(count = dropped.len(), "dropping byte events");
        }

        if !self.phase.reads.is_shutdown() {
            self.phase.reads = IoState::Shutdown;
            self.transport.shutdown_reads();
        }
        if self.num_active_writes > 0 {
            self.phase.reset_after_draining_writes = true;
        } else {
            self.finish_writes_shutdown();
            self.transport.close_with_reset();
        }
        self.check_for_shutdown();
    }

    /// Tear the connection down immediately with a generic error.
    pub fn drop_connection(&mut self) {
        self.shutdown_transport_with_reset(Error::Dropped);
    }

    fn send_goaway_frame(&mut self, last_good: StreamId, code: ErrorCode) {
        let res = self
            .codec
            .generate_goaway(&mut self.write_buf, last_good, code);
        self.note_encoded_lossy(res);
        self.schedule_write();
    }

    /// Highest incoming stream id seen, or MAX when nothing has arrived
    /// yet.
    fn graceful_goaway_ack(&self) -> StreamId {
        self.highest_incoming_stream.unwrap_or(StreamId::MAX)
    }

    fn check_for_shutdown(&mut self) {
        if self.phase.destroyed {
            return;
        }
        if self.phase.reads.is_shutdown()
            && self.phase.writes.is_shutdown()
            && self.transactions.is_empty()
            && self.num_active_writes == 0
        {
            debug!("destroying session");
            self.phase.destroyed = true;
            self.pending_writes.detach_all();
            let dropped = self.byte_events.drain();
            if !dropped.is_empty() {
                trace!(count = dropped.len(), "delete-ack for pending byte events");
            }
            self.transport.close();
            metrics::SESSIONS_DESTROYED.increment();
            metrics::SESSIONS_ACTIVE.decrement();
            if let Some(info) = self.info.as_deref_mut() {
                info.on_destroy();
            }
        }
    }

    // === Timeouts ===

    /// Check all armed deadlines against `now`, firing the corresponding
    /// error paths.
    pub fn poll_timeouts(&mut self, now: Instant) {
        if self.phase.destroyed {
            return;
        }
        if !self.phase.writes.is_shutdown() && self.timeouts.write_expired(now) {
            self.write_timeout_expired();
            return;
        }
        if !self.phase.reads.is_shutdown() && self.timeouts.read_expired(now) {
            self.read_timeout_expired();
            return;
        }
        if let Some(limit) = self.config.transaction_timeout {
            let expired: Vec<StreamId> = self
                .transactions
                .values()
                .filter(|t| now.duration_since(t.last_progress) >= limit)
                .map(|t| t.id())
                .collect();
            for id in expired {
                self.transaction_timeout(id, now);
            }
        }
    }

    /// Earliest armed deadline across the session and its transactions.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.timeouts.next_deadline();
        if let Some(limit) = self.config.transaction_timeout {
            for txn in self.transactions.values() {
                let candidate = txn.last_progress + limit;
                deadline = Some(match deadline {
                    Some(current) => current.min(candidate),
                    None => candidate,
                });
            }
        }
        deadline
    }

    fn read_timeout_expired(&mut self) {
        debug!("read timeout");
        self.set_close_reason(ConnectionCloseReason::TimedOut);
        let affected: Vec<StreamId> = self
            .transactions
            .values()
            .filter(|t| !t.ingress_state.is_closed())
            .map(|t| t.id())
            .collect();
        self.mass_error(affected, &Error::ReadTimeout, false);
        self.shutdown_transport_impl(true, true);
    }

    fn write_timeout_expired(&mut self) {
        debug!("write timeout");
        self.set_close_reason(ConnectionCloseReason::TimedOut);
        self.shutdown_transport_with_reset(Error::WriteTimeout);
    }

    fn transaction_timeout(&mut self, id: StreamId, now: Instant) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        txn.touch(now);
        if txn.handler.is_none() && !txn.detached {
            // No handler yet: answer with a synthetic timeout response.
            let handler = self
                .controller
                .get_transaction_timeout_handler()
                .unwrap_or_else(|| Box::new(DirectResponseHandler::from_error()));
            txn.handler = Some(handler);
            txn.close_ingress();
            self.deliver(id, |h, ctx| h.on_error(ctx, Error::TransactionTimeout));
            self.maybe_remove(id);
        } else {
            self.deliver(id, |h, ctx| h.on_error(ctx, Error::TransactionTimeout));
        }
    }

    // === Transaction bookkeeping ===

    /// Run a handler callback with the handler temporarily moved out of
    /// the table, so the callback can re-enter the session freely.
    fn deliver<F>(&mut self, id: StreamId, f: F)
    where
        F: FnOnce(&mut dyn TransactionHandler, &mut TxnCtx<'_>),
    {
        let Some(mut handler) = self
            .transactions
            .get_mut(&id)
            .and_then(|t| t.handler.take())
        else {
            return;
        };
        {
            let mut ctx = TxnCtx {
                session: self,
                stream_id: id,
            };
            f(handler.as_mut(), &mut ctx);
        }
        if let Some(txn) = self.transactions.get_mut(&id)
            && !txn.detached
        {
            txn.handler = Some(handler);
        }
        self.maybe_remove(id);
    }

    fn maybe_remove(&mut self, id: StreamId) {
        if self
            .transactions
            .get(&id)
            .is_some_and(|txn| txn.is_done())
        {
            self.remove_transaction(id);
        }
    }

    fn remove_transaction(&mut self, id: StreamId) {
        let Some(txn) = self.transactions.remove(&id) else {
            return;
        };
        if txn.enqueued {
            self.egress_queue.remove(id, txn.priority());
        }
        self.pending_read_size = self
            .pending_read_size
            .saturating_sub(txn.buffered_ingress_bytes);
        if txn.origin().locally_initiated() {
            self.outgoing_streams = self.outgoing_streams.saturating_sub(1);
        } else {
            self.incoming_streams = self.incoming_streams.saturating_sub(1);
        }
        if txn.is_pushed() {
            self.pushed_txns = self.pushed_txns.saturating_sub(1);
        }
        trace!(stream = %id, "transaction removed");
        if let Some(info) = self.info.as_deref_mut() {
            info.on_transaction_detached();
        }
        self.update_streams_full_state();

        if self.transactions.is_empty() {
            if let Some(info) = self.info.as_deref_mut() {
                info.on_deactivate_connection();
            }
            if self.phase.draining && self.direction == TransportDirection::Upstream {
                self.shutdown_transport_impl(true, true);
                return;
            }
            self.try_finish_write_drain();
        }
        if self.pending_read_size < self.config.read_buf_limit {
            self.resume_reads();
        }
        self.check_for_shutdown();
    }

    /// Error out a set of transactions from an id snapshot; callbacks may
    /// mutate the table freely.
    fn mass_error(&mut self, ids: Vec<StreamId>, error: &Error, write_side: bool) {
        for id in ids {
            if !self.transactions.contains_key(&id) {
                continue;
            }
            let err = error.duplicate();
            if write_side {
                self.deliver(id, move |h, ctx| h.on_write_error(ctx, &err));
            } else {
                self.deliver(id, move |h, ctx| h.on_error(ctx, err));
            }
            if let Some(txn) = self.transactions.get_mut(&id) {
                txn.close_ingress();
                txn.close_egress();
            }
            self.remove_transaction(id);
        }
    }

    fn snapshot_ids(&self) -> Vec<StreamId> {
        self.transactions.keys().copied().collect()
    }

    fn set_close_reason(&mut self, reason: ConnectionCloseReason) {
        if self.close_reason == ConnectionCloseReason::None {
            self.close_reason = reason;
        }
    }

    fn update_streams_full_state(&mut self) {
        let full = self.outgoing_streams >= self.max_concurrent_outgoing_streams();
        if full != self.outgoing_full_reported {
            self.outgoing_full_reported = full;
            if let Some(info) = self.info.as_deref_mut() {
                if full {
                    info.on_settings_outgoing_streams_full();
                } else {
                    info.on_settings_outgoing_streams_not_full();
                }
            }
        }
    }

    // === Codec encode accounting ===

    /// Track bytes entering the write buffer. An encode failure is
    /// session-fatal: everything aborts and the transport resets.
    fn note_encoded(&mut self, res: Result<usize, CodecError>) -> Result<usize, Error> {
        match res {
            Ok(n) => {
                self.bytes_scheduled += n as u64;
                Ok(n)
            }
            Err(e) => {
                warn!(error = %e, "codec encode failure");
                self.shutdown_transport_with_reset(Error::Codec(e.clone()));
                Err(Error::Codec(e))
            }
        }
    }

    /// Like [`note_encoded`] but swallows failures; used on shutdown
    /// paths that must not recurse into error handling.
    fn note_encoded_lossy(&mut self, res: Result<usize, CodecError>) -> usize {
        match res {
            Ok(n) => {
                self.bytes_scheduled += n as u64;
                n
            }
            Err(e) => {
                warn!(error = %e, "codec encode failure ignored");
                0
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.phase.destroyed {
            metrics::SESSIONS_DESTROYED.increment();
            metrics::SESSIONS_ACTIVE.decrement();
        }
    }
}
