//! Per-stream transaction state.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use crate::codec::{ErrorCode, HeaderField, StreamId};
use crate::error::Error;
use crate::session::flow_control::{RecvWindow, SendWindow};
use crate::session::handler::TransactionHandler;

/// Lifecycle of one half (ingress or egress) of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    /// Half is active.
    Open,
    /// EOM accepted from the handler but not yet serialized.
    EomQueued,
    /// EOM serialized into the write buffer.
    EomSent,
    /// Half is finished.
    Closed,
}

impl HalfState {
    pub fn is_closed(self) -> bool {
        self == HalfState::Closed
    }
}

/// How the transaction came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOrigin {
    /// Peer-initiated.
    Incoming,
    /// Locally initiated.
    Outgoing,
    /// Locally initiated push, tied to an incoming transaction.
    PushedLocal { assoc: StreamId },
    /// Peer-initiated push, tied to a locally-initiated transaction.
    PushedRemote { assoc: StreamId },
}

impl TxnOrigin {
    /// Whether this side opened the stream.
    pub fn locally_initiated(self) -> bool {
        matches!(self, TxnOrigin::Outgoing | TxnOrigin::PushedLocal { .. })
    }
}

/// Queued egress awaiting the scheduler.
#[derive(Debug)]
pub enum EgressPiece {
    Body { chunk: Bytes, eom: bool },
    ChunkHeader { length: usize },
    ChunkTerminator,
    Trailers(Vec<HeaderField>),
    Eom,
}

/// Ingress events buffered while the handler has ingress paused.
#[derive(Debug)]
pub enum IngressEvent {
    Body(Bytes),
    ChunkHeader(usize),
    ChunkComplete,
    Trailers(Vec<HeaderField>),
    MessageComplete { upgrade: bool },
    Error(Error),
    Abort(ErrorCode),
}

/// One request/response exchange multiplexed on the session.
pub struct Transaction {
    id: StreamId,
    priority: u8,
    origin: TxnOrigin,
    pub(crate) handler: Option<Box<dyn TransactionHandler>>,

    pub(crate) ingress_state: HalfState,
    pub(crate) egress_state: HalfState,
    pub(crate) ingress_paused: bool,
    pub(crate) egress_paused: bool,
    /// Present in the session's egress queue.
    pub(crate) enqueued: bool,
    /// Handler has released its reference.
    pub(crate) detached: bool,
    /// A reset has been emitted for this stream.
    pub(crate) aborted: bool,
    /// Message head received (handler attach point has passed).
    pub(crate) ingress_started: bool,
    /// Message head serialized.
    pub(crate) headers_sent: bool,

    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: RecvWindow,

    pub(crate) pending_egress: VecDeque<EgressPiece>,
    /// Body bytes among the queued pieces.
    pub(crate) pending_egress_bytes: usize,

    pub(crate) deferred_ingress: VecDeque<IngressEvent>,
    /// Ingress body bytes delivered to this transaction and not yet
    /// reported processed. Summed across transactions this is the
    /// session's `pending_read_size`.
    pub(crate) buffered_ingress_bytes: usize,

    pub(crate) last_progress: Instant,
}

impl Transaction {
    pub fn new(id: StreamId, origin: TxnOrigin, priority: u8, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            priority,
            origin,
            handler: None,
            ingress_state: HalfState::Open,
            egress_state: HalfState::Open,
            ingress_paused: false,
            egress_paused: false,
            enqueued: false,
            detached: false,
            aborted: false,
            ingress_started: false,
            headers_sent: false,
            send_window: SendWindow::new(send_window),
            recv_window: RecvWindow::new(recv_window),
            pending_egress: VecDeque::new(),
            pending_egress_bytes: 0,
            deferred_ingress: VecDeque::new(),
            buffered_ingress_bytes: 0,
            last_progress: Instant::now(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn origin(&self) -> TxnOrigin {
        self.origin
    }

    pub fn is_incoming(&self) -> bool {
        self.origin == TxnOrigin::Incoming
    }

    pub fn is_pushed(&self) -> bool {
        matches!(
            self.origin,
            TxnOrigin::PushedLocal { .. } | TxnOrigin::PushedRemote { .. }
        )
    }

    /// Both halves finished and the handler has let go.
    pub fn is_done(&self) -> bool {
        self.ingress_state.is_closed() && self.egress_state.is_closed() && self.detached
    }

    /// Both halves finished; only the handler reference keeps it alive.
    pub fn halves_closed(&self) -> bool {
        self.ingress_state.is_closed() && self.egress_state.is_closed()
    }

    /// Whether the scheduler has anything to serialize for this stream.
    pub fn has_pending_egress(&self) -> bool {
        !self.pending_egress.is_empty()
    }

    /// Whether the head of the egress queue is blocked on stream flow
    /// control. Non-body pieces never are.
    pub fn egress_blocked_on_window(&self) -> bool {
        match self.pending_egress.front() {
            Some(EgressPiece::Body { chunk, .. }) => {
                !chunk.is_empty() && !self.send_window.is_open()
            }
            _ => false,
        }
    }

    /// Queue an egress piece, tracking body byte counts.
    pub fn queue_egress(&mut self, piece: EgressPiece) {
        if let EgressPiece::Body { chunk, .. } = &piece {
            self.pending_egress_bytes += chunk.len();
        }
        self.pending_egress.push_back(piece);
    }

    /// Record ingress or egress activity for the transaction timeout.
    pub fn touch(&mut self, now: Instant) {
        self.last_progress = now;
    }

    /// Close the ingress half.
    pub fn close_ingress(&mut self) {
        self.ingress_state = HalfState::Closed;
    }

    /// Close the egress half.
    pub fn close_egress(&mut self) {
        self.egress_state = HalfState::Closed;
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("origin", &self.origin)
            .field("ingress_state", &self.ingress_state)
            .field("egress_state", &self.egress_state)
            .field("detached", &self.detached)
            .field("aborted", &self.aborted)
            .field("pending_egress", &self.pending_egress.len())
            .field("buffered_ingress_bytes", &self.buffered_ingress_bytes)
            .finish()
    }
}
