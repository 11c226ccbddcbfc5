//! Codec abstraction.
//!
//! The session is wire-format agnostic: a [`SessionCodec`] translates raw
//! transport bytes into an ordered stream of [`CodecEvent`]s and serializes
//! outbound frames into the session's write buffer. Implementations own
//! stream-id assignment (even/odd by direction, monotonic per side).
//!
//! Events are delivered through a caller-supplied `Vec`, in emission order,
//! mirroring how the connection layer the session replaces queued its
//! events. Parse failures are events too, so they stay ordered relative to
//! the frames around them.

pub mod message;
pub mod types;

pub use message::{HeaderField, Message};
pub use types::{ErrorCode, Setting, SettingId, StreamId, TransportDirection};

use bytes::{Bytes, BytesMut};

/// Default per-stream flow control window.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65536;

/// A parse or serialization failure reported by the codec.
#[derive(Debug, Clone)]
pub struct CodecError {
    /// Wire-level error code to convey to the peer.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// HTTP status a direct error response should carry, when the error
    /// maps onto one (e.g. 400 for a malformed request head).
    pub status: Option<u16>,
}

impl CodecError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
        }
    }

    /// Attach the HTTP status a direct response should use.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CodecError {}

/// Structured events produced by codec ingress, in emission order.
#[derive(Debug)]
pub enum CodecEvent {
    /// A new message has started on a stream.
    MessageBegin { stream_id: StreamId, priority: u8 },
    /// A pushed message has started (downstream sessions only).
    PushMessageBegin {
        stream_id: StreamId,
        assoc_stream_id: StreamId,
    },
    /// The full message head is available.
    HeadersComplete { stream_id: StreamId, msg: Message },
    /// A chunk of message body.
    Body { stream_id: StreamId, chunk: Bytes },
    /// A chunked-encoding chunk header (length prefix).
    ChunkHeader { stream_id: StreamId, length: usize },
    /// A chunked-encoding chunk terminator.
    ChunkComplete { stream_id: StreamId },
    /// Trailing headers.
    TrailersComplete {
        stream_id: StreamId,
        trailers: Vec<HeaderField>,
    },
    /// End of message.
    MessageComplete { stream_id: StreamId, upgrade: bool },
    /// Parse error. `stream_id` is `None` for session-scoped errors.
    /// `new_txn` is set when the error arrived on a stream the session has
    /// not admitted yet and a direct error response is appropriate.
    Error {
        stream_id: Option<StreamId>,
        error: CodecError,
        new_txn: bool,
    },
    /// Peer reset a stream.
    Abort { stream_id: StreamId, code: ErrorCode },
    /// Peer is draining the session.
    Goaway {
        last_good_stream_id: StreamId,
        code: ErrorCode,
    },
    /// Peer pinged us; a reply should be serialized promptly.
    PingRequest { id: u64 },
    /// Peer acknowledged one of our pings.
    PingReply { id: u64 },
    /// Flow control credit. Stream 0 addresses the connection window.
    WindowUpdate { stream_id: StreamId, delta: u32 },
    /// Peer settings.
    Settings { settings: Vec<Setting> },
}

/// Wire-format engine consumed by the session.
///
/// Ingress: [`on_ingress`](SessionCodec::on_ingress) consumes as many bytes
/// from the read buffer as it can and appends events. Egress: the
/// `generate_*` family serializes frames into the supplied buffer and
/// returns the byte count written; a codec that does not express a frame
/// kind returns `Ok(0)` and the session falls back to coarser behavior
/// (e.g. a reset on a codec without per-stream reset closes the
/// connection).
pub trait SessionCodec {
    /// Whether this codec multiplexes concurrent streams (and therefore
    /// carries flow control and stream-counting semantics).
    fn supports_stream_multiplexing(&self) -> bool;

    /// Whether the codec can push server-initiated streams.
    fn supports_push_transactions(&self) -> bool {
        false
    }

    /// Whether the codec can reset a single stream without closing the
    /// connection.
    fn supports_stream_reset(&self) -> bool {
        self.supports_stream_multiplexing()
    }

    /// Whether a draining session should first advertise a soft GOAWAY at
    /// MAX before the definitive one.
    fn supports_two_phase_drain(&self) -> bool {
        false
    }

    /// Whether the connection can be reused for another message after the
    /// current ones complete.
    fn is_reusable(&self) -> bool {
        true
    }

    /// Initial per-stream send window granted by the peer before any
    /// SETTINGS arrive.
    fn initial_send_window(&self) -> u32 {
        DEFAULT_INITIAL_WINDOW_SIZE
    }

    /// Initial connection-level send window.
    fn initial_conn_send_window(&self) -> u32 {
        self.initial_send_window()
    }

    /// Allocate the next locally-initiated stream id.
    fn next_outgoing_stream_id(&mut self) -> StreamId;

    /// Consume bytes from `buf`, appending events in emission order.
    /// Returns the number of bytes consumed. Unconsumed bytes remain for
    /// the next call.
    fn on_ingress(&mut self, buf: &mut BytesMut, events: &mut Vec<CodecEvent>) -> usize;

    /// Serialize any connection preamble (magic bytes, first SETTINGS).
    fn generate_connection_preface(&mut self, _buf: &mut BytesMut) -> usize {
        0
    }

    /// Serialize a message head.
    fn generate_headers(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        msg: &Message,
        eom: bool,
    ) -> Result<usize, CodecError>;

    /// Serialize a body chunk. `eom` marks the final byte of the message.
    fn generate_body(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        chunk: &[u8],
        eom: bool,
    ) -> Result<usize, CodecError>;

    /// Serialize a chunk header (chunked transfer framing).
    fn generate_chunk_header(
        &mut self,
        _buf: &mut BytesMut,
        _stream_id: StreamId,
        _length: usize,
    ) -> Result<usize, CodecError> {
        Ok(0)
    }

    /// Serialize a chunk terminator.
    fn generate_chunk_terminator(
        &mut self,
        _buf: &mut BytesMut,
        _stream_id: StreamId,
    ) -> Result<usize, CodecError> {
        Ok(0)
    }

    /// Serialize trailing headers.
    fn generate_trailers(
        &mut self,
        _buf: &mut BytesMut,
        _stream_id: StreamId,
        _trailers: &[HeaderField],
    ) -> Result<usize, CodecError> {
        Ok(0)
    }

    /// Serialize a standalone end-of-message marker.
    fn generate_eom(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
    ) -> Result<usize, CodecError>;

    /// Serialize a stream reset. Codecs without per-stream reset return
    /// `Ok(0)`; the session then treats the abort as connection-fatal.
    fn generate_rst_stream(
        &mut self,
        _buf: &mut BytesMut,
        _stream_id: StreamId,
        _code: ErrorCode,
    ) -> Result<usize, CodecError> {
        Ok(0)
    }

    /// Serialize a GOAWAY naming the last stream this side will process.
    fn generate_goaway(
        &mut self,
        _buf: &mut BytesMut,
        _last_good_stream_id: StreamId,
        _code: ErrorCode,
    ) -> Result<usize, CodecError> {
        Ok(0)
    }

    /// Serialize a ping request. `Ok(0)` means pings are unsupported.
    fn generate_ping_request(
        &mut self,
        _buf: &mut BytesMut,
        _id: u64,
    ) -> Result<usize, CodecError> {
        Ok(0)
    }

    /// Serialize a ping reply.
    fn generate_ping_reply(&mut self, _buf: &mut BytesMut, _id: u64) -> Result<usize, CodecError> {
        Ok(0)
    }

    /// Serialize a window update. Stream 0 addresses the connection window.
    fn generate_window_update(
        &mut self,
        _buf: &mut BytesMut,
        _stream_id: StreamId,
        _delta: u32,
    ) -> Result<usize, CodecError> {
        Ok(0)
    }

    /// Serialize a SETTINGS frame.
    fn generate_settings(
        &mut self,
        _buf: &mut BytesMut,
        _settings: &[Setting],
    ) -> Result<usize, CodecError> {
        Ok(0)
    }

    /// Serialize a push promise announcing `pushed_stream_id` on
    /// `assoc_stream_id`.
    fn generate_push_promise(
        &mut self,
        _buf: &mut BytesMut,
        _assoc_stream_id: StreamId,
        _pushed_stream_id: StreamId,
        _msg: &Message,
    ) -> Result<usize, CodecError> {
        Ok(0)
    }
}
