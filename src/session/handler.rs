//! Handler-facing traits and the per-transaction operation surface.
//!
//! Handlers never touch the transport. Every callback hands the handler a
//! [`TxnCtx`], a short-lived borrow of the session scoped to one stream,
//! through which all egress and lifecycle operations are issued.

use bytes::Bytes;

use crate::codec::{ErrorCode, HeaderField, Message, StreamId};
use crate::error::Error;
use crate::session::Session;

/// The context handed to handler callbacks for issuing operations.
///
/// This is a short-lived borrow into the session's state.
pub struct TxnCtx<'a> {
    pub(crate) session: &'a mut Session,
    pub(crate) stream_id: StreamId,
}

impl<'a> TxnCtx<'a> {
    /// The stream this context addresses.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Serialize a message head. Returns the bytes handed to the codec.
    pub fn send_headers(&mut self, msg: &Message) -> Result<usize, Error> {
        self.session.send_headers(self.stream_id, msg)
    }

    /// Queue body for the egress scheduler. `include_eom` marks the final
    /// byte of the message. Returns bytes serialized immediately (0 when
    /// the scheduler will serialize later).
    pub fn send_body(&mut self, body: Bytes, include_eom: bool) -> Result<usize, Error> {
        self.session.send_body(self.stream_id, body, include_eom)
    }

    /// Queue a chunked-encoding chunk header.
    pub fn send_chunk_header(&mut self, length: usize) -> Result<usize, Error> {
        self.session.send_chunk_header(self.stream_id, length)
    }

    /// Queue a chunked-encoding terminator.
    pub fn send_chunk_terminator(&mut self) -> Result<usize, Error> {
        self.session.send_chunk_terminator(self.stream_id)
    }

    /// Queue trailing headers.
    pub fn send_trailers(&mut self, trailers: Vec<HeaderField>) -> Result<usize, Error> {
        self.session.send_trailers(self.stream_id, trailers)
    }

    /// Queue end-of-message.
    pub fn send_eom(&mut self) -> Result<usize, Error> {
        self.session.send_eom(self.stream_id)
    }

    /// Reset the stream. Idempotent per transaction.
    pub fn send_abort(&mut self, code: ErrorCode) -> Result<usize, Error> {
        self.session.send_abort(self.stream_id, code)
    }

    /// Grant the peer stream-level flow control credit.
    pub fn send_window_update(&mut self, bytes: u32) -> Result<usize, Error> {
        self.session.send_stream_window_update(self.stream_id, bytes)
    }

    /// Re-enter the egress queue (egress became available out of band).
    pub fn notify_pending_egress(&mut self) {
        self.session.notify_pending_egress(self.stream_id);
    }

    /// Stop delivering ingress to this handler; events queue up and count
    /// toward the session read buffer limit.
    pub fn pause_ingress(&mut self) {
        self.session.pause_ingress(self.stream_id);
    }

    /// Resume ingress delivery; deferred events drain in FIFO order first.
    pub fn resume_ingress(&mut self) {
        self.session.resume_ingress(self.stream_id);
    }

    /// Report buffered ingress body consumed, shrinking the session's
    /// aggregate and possibly resuming transport reads.
    pub fn notify_ingress_body_processed(&mut self, bytes: usize) {
        self.session.notify_ingress_body_processed(self.stream_id, bytes);
    }

    /// Release the handler's reference to the transaction. After both
    /// halves close, the transaction is removed.
    pub fn detach(&mut self) {
        self.session.detach(self.stream_id);
    }

    /// Open a pushed stream associated with this one (downstream only).
    pub fn new_pushed_transaction(
        &mut self,
        handler: Box<dyn TransactionHandler>,
        priority: u8,
    ) -> Result<StreamId, Error> {
        self.session
            .new_pushed_transaction(self.stream_id, handler, priority)
    }
}

/// Application-side consumer of one transaction.
///
/// Ingress callbacks arrive in codec emission order. A handler observes at
/// most one terminal ingress callback (`on_eom`, `on_error`, or
/// `on_abort`) and at most one `on_write_error`.
pub trait TransactionHandler {
    /// The transaction is live and operations may be issued. For
    /// locally-initiated transactions this is where the request starts.
    fn on_attached(&mut self, _txn: &mut TxnCtx<'_>) {}

    /// Full message head received.
    fn on_headers_complete(&mut self, txn: &mut TxnCtx<'_>, msg: Message);

    /// Body chunk received. The handler owes a matching
    /// `notify_ingress_body_processed` once it has consumed the bytes.
    fn on_body(&mut self, txn: &mut TxnCtx<'_>, chunk: Bytes);

    /// Chunked-encoding chunk header received.
    fn on_chunk_header(&mut self, _txn: &mut TxnCtx<'_>, _length: usize) {}

    /// Chunked-encoding chunk terminator received.
    fn on_chunk_complete(&mut self, _txn: &mut TxnCtx<'_>) {}

    /// Trailing headers received.
    fn on_trailers(&mut self, _txn: &mut TxnCtx<'_>, _trailers: Vec<HeaderField>) {}

    /// Ingress message complete.
    fn on_eom(&mut self, txn: &mut TxnCtx<'_>);

    /// Ingress upgrade requested (e.g. HTTP/1.1 Upgrade).
    fn on_upgrade(&mut self, _txn: &mut TxnCtx<'_>) {}

    /// Terminal: the transaction failed.
    fn on_error(&mut self, txn: &mut TxnCtx<'_>, error: Error);

    /// Terminal: the peer reset the stream.
    fn on_abort(&mut self, _txn: &mut TxnCtx<'_>, _code: ErrorCode) {}

    /// Egress is paused (flow control or session backpressure); stop
    /// calling send until resumed.
    fn on_egress_paused(&mut self, _txn: &mut TxnCtx<'_>) {}

    /// Egress may continue.
    fn on_egress_resumed(&mut self, _txn: &mut TxnCtx<'_>) {}

    /// Terminal for the egress side: a transport write failed.
    fn on_write_error(&mut self, _txn: &mut TxnCtx<'_>, _error: &Error) {}

    /// The peer promised a pushed stream associated with this
    /// transaction. Return a handler to accept it, or `None` to refuse.
    fn on_pushed_transaction(
        &mut self,
        _txn: &mut TxnCtx<'_>,
        _pushed: StreamId,
    ) -> Option<Box<dyn TransactionHandler>> {
        None
    }
}

/// Produces handlers when inbound transactions arrive (downstream
/// sessions) and synthetic handlers for error paths.
pub trait SessionController {
    /// A new inbound message head arrived; produce its handler. Returning
    /// `None` makes the session answer with a direct error response.
    fn get_request_handler(&mut self, msg: &Message) -> Option<Box<dyn TransactionHandler>>;

    /// Handler for a parse error that still warrants a response.
    fn get_parse_error_handler(
        &mut self,
        _error: &Error,
    ) -> Option<Box<dyn TransactionHandler>> {
        None
    }

    /// Handler for a transaction that timed out before one was attached.
    fn get_transaction_timeout_handler(&mut self) -> Option<Box<dyn TransactionHandler>> {
        None
    }
}

/// Observer of session lifecycle events. Never recovers errors.
pub trait InfoCallback {
    fn on_create(&mut self) {}
    fn on_destroy(&mut self) {}
    fn on_read(&mut self, _bytes: usize) {}
    fn on_write(&mut self, _bytes: usize) {}
    fn on_request_begin(&mut self) {}
    fn on_request_end(&mut self, _max_ingress_queue: usize) {}
    fn on_activate_connection(&mut self) {}
    fn on_deactivate_connection(&mut self) {}
    fn on_ingress_message(&mut self, _msg: &Message) {}
    fn on_ingress_error(&mut self, _error: &Error) {}
    fn on_ingress_paused(&mut self) {}
    fn on_ingress_limit_exceeded(&mut self) {}
    fn on_transaction_detached(&mut self) {}
    fn on_ping_reply(&mut self, _latency_ns: u64) {}
    fn on_settings_outgoing_streams_full(&mut self) {}
    fn on_settings_outgoing_streams_not_full(&mut self) {}
}

/// Synthetic handler that answers a transaction with a minimal error
/// response and completes it. Installed when a parse error or timeout
/// arrives on a transaction that has no application handler.
pub struct DirectResponseHandler {
    status: Option<u16>,
    responded: bool,
}

impl DirectResponseHandler {
    /// Respond with a status derived from the triggering error.
    pub fn from_error() -> Self {
        Self {
            status: None,
            responded: false,
        }
    }

    /// Respond with a fixed status.
    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            responded: false,
        }
    }

    fn respond(&mut self, txn: &mut TxnCtx<'_>, status: u16) {
        if self.responded {
            return;
        }
        self.responded = true;
        let msg = Message::response(status);
        let _ = txn.send_headers(&msg);
        let _ = txn.send_eom();
        txn.detach();
    }
}

impl TransactionHandler for DirectResponseHandler {
    fn on_attached(&mut self, txn: &mut TxnCtx<'_>) {
        if let Some(status) = self.status {
            self.respond(txn, status);
        }
    }

    fn on_headers_complete(&mut self, _txn: &mut TxnCtx<'_>, _msg: Message) {}

    fn on_body(&mut self, txn: &mut TxnCtx<'_>, chunk: Bytes) {
        // Discard; the response does not depend on the request body.
        txn.notify_ingress_body_processed(chunk.len());
    }

    fn on_eom(&mut self, _txn: &mut TxnCtx<'_>) {}

    fn on_error(&mut self, txn: &mut TxnCtx<'_>, error: Error) {
        let status = self.status.unwrap_or_else(|| error.direct_response_status());
        self.respond(txn, status);
    }
}
