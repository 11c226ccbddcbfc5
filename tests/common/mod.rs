//! Shared test harness: a mock codec with a tiny tagged frame format, a
//! recording transport, and scripted transaction handlers.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{BufMut, Bytes, BytesMut};

use http_session::codec::{
    CodecError, CodecEvent, ErrorCode, Message, SessionCodec, Setting, SettingId, StreamId,
    TransportDirection,
};
use http_session::session::handler::{
    InfoCallback, SessionController, TransactionHandler, TxnCtx,
};
use http_session::transport::{Transport, WriteFlags};
use http_session::{Error, Session, SessionConfig};

// === Wire format: tag(1) | stream(4 BE) | len(4 BE) | payload ===

pub const FRAME_HDR: usize = 9;

pub const TAG_HEADERS: u8 = 0x1;
pub const TAG_BODY: u8 = 0x2;
pub const TAG_EOM: u8 = 0x3;
pub const TAG_RST: u8 = 0x4;
pub const TAG_GOAWAY: u8 = 0x5;
pub const TAG_PING_REQ: u8 = 0x6;
pub const TAG_PING_REP: u8 = 0x7;
pub const TAG_WINDOW_UPDATE: u8 = 0x8;
pub const TAG_SETTINGS: u8 = 0x9;
pub const TAG_PUSH_PROMISE: u8 = 0xA;
pub const TAG_CHUNK_HEADER: u8 = 0xB;
pub const TAG_CHUNK_TERM: u8 = 0xC;
pub const TAG_TRAILERS: u8 = 0xD;
/// Injected stream-scoped parse error on a new stream.
pub const TAG_BAD_NEW_STREAM: u8 = 0xE1;
/// Injected session-scoped parse error.
pub const TAG_BAD_SESSION: u8 = 0xE2;
/// Message begin with no head yet (headers still in flight).
pub const TAG_BEGIN: u8 = 0xF0;

pub fn frame(tag: u8, stream: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HDR + payload.len());
    out.push(tag);
    out.extend_from_slice(&stream.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// HEADERS payload: priority(1) | flags(1, bit0 = eom) | head
pub fn headers_frame(stream: u32, priority: u8, eom: bool, head: &Message) -> Vec<u8> {
    let mut payload = vec![priority, eom as u8];
    encode_head(head, &mut payload);
    frame(TAG_HEADERS, stream, &payload)
}

pub fn request_frame(stream: u32, priority: u8, eom: bool) -> Vec<u8> {
    headers_frame(stream, priority, eom, &Message::request("GET", "/"))
}

/// BODY payload: flags(1, bit0 = eom) | data
pub fn body_frame(stream: u32, eom: bool, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![eom as u8];
    payload.extend_from_slice(data);
    frame(TAG_BODY, stream, &payload)
}

pub fn eom_frame(stream: u32) -> Vec<u8> {
    frame(TAG_EOM, stream, &[])
}

pub fn rst_frame(stream: u32, code: ErrorCode) -> Vec<u8> {
    frame(TAG_RST, stream, &code.to_u32().to_be_bytes())
}

pub fn goaway_frame(last_good: u32, code: ErrorCode) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&last_good.to_be_bytes());
    payload.extend_from_slice(&code.to_u32().to_be_bytes());
    frame(TAG_GOAWAY, 0, &payload)
}

pub fn ping_req_frame(id: u64) -> Vec<u8> {
    frame(TAG_PING_REQ, 0, &id.to_be_bytes())
}

pub fn ping_rep_frame(id: u64) -> Vec<u8> {
    frame(TAG_PING_REP, 0, &id.to_be_bytes())
}

pub fn window_update_frame(stream: u32, delta: u32) -> Vec<u8> {
    frame(TAG_WINDOW_UPDATE, stream, &delta.to_be_bytes())
}

pub fn settings_frame(settings: &[(SettingId, u32)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (id, value) in settings {
        payload.extend_from_slice(&(*id as u16).to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    frame(TAG_SETTINGS, 0, &payload)
}

fn encode_head(msg: &Message, out: &mut Vec<u8>) {
    if let Some(status) = msg.status {
        out.push(1);
        out.extend_from_slice(&status.to_be_bytes());
    } else {
        out.push(0);
        let method = msg.method.as_deref().unwrap_or("GET");
        let path = msg.path.as_deref().unwrap_or("/");
        out.push(method.len() as u8);
        out.extend_from_slice(method.as_bytes());
        out.extend_from_slice(&(path.len() as u16).to_be_bytes());
        out.extend_from_slice(path.as_bytes());
    }
}

fn decode_head(payload: &[u8], stream: u32) -> Message {
    let mut msg = if payload.first() == Some(&1) {
        let status = u16::from_be_bytes([payload[1], payload[2]]);
        Message::response(status)
    } else {
        let mlen = payload[1] as usize;
        let method = String::from_utf8_lossy(&payload[2..2 + mlen]).into_owned();
        let plen = u16::from_be_bytes([payload[2 + mlen], payload[3 + mlen]]) as usize;
        let path = String::from_utf8_lossy(&payload[4 + mlen..4 + mlen + plen]).into_owned();
        Message::request(method, path)
    };
    msg.stream_id = StreamId::new(stream);
    msg
}

/// A decoded frame for assertions on the wire output.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub tag: u8,
    pub stream: u32,
    pub payload: Vec<u8>,
}

pub fn parse_frames(mut data: &[u8]) -> Vec<WireFrame> {
    let mut frames = Vec::new();
    while data.len() >= FRAME_HDR {
        let tag = data[0];
        let stream = u32::from_be_bytes(data[1..5].try_into().unwrap());
        let len = u32::from_be_bytes(data[5..9].try_into().unwrap()) as usize;
        assert!(data.len() >= FRAME_HDR + len, "truncated frame");
        frames.push(WireFrame {
            tag,
            stream,
            payload: data[FRAME_HDR..FRAME_HDR + len].to_vec(),
        });
        data = &data[FRAME_HDR + len..];
    }
    assert!(data.is_empty(), "trailing bytes after frames");
    frames
}

// === Mock codec ===

pub struct MockCodec {
    multiplexing: bool,
    supports_push: bool,
    two_phase: bool,
    stream_window: u32,
    conn_window: u32,
    next_stream_id: u32,
}

impl MockCodec {
    /// Codec for a client-side session: locally-initiated streams are odd.
    pub fn upstream() -> Self {
        Self {
            multiplexing: true,
            supports_push: true,
            two_phase: true,
            stream_window: 65536,
            conn_window: 65536,
            next_stream_id: 1,
        }
    }

    /// Codec for a server-side session: locally-initiated streams are even.
    pub fn downstream() -> Self {
        Self {
            next_stream_id: 2,
            ..Self::upstream()
        }
    }

    pub fn conn_window(mut self, value: u32) -> Self {
        self.conn_window = value;
        self
    }

    pub fn stream_window(mut self, value: u32) -> Self {
        self.stream_window = value;
        self
    }

    pub fn no_push(mut self) -> Self {
        self.supports_push = false;
        self
    }
}

impl SessionCodec for MockCodec {
    fn supports_stream_multiplexing(&self) -> bool {
        self.multiplexing
    }

    fn supports_push_transactions(&self) -> bool {
        self.supports_push
    }

    fn supports_two_phase_drain(&self) -> bool {
        self.two_phase
    }

    fn initial_send_window(&self) -> u32 {
        self.stream_window
    }

    fn initial_conn_send_window(&self) -> u32 {
        self.conn_window
    }

    fn next_outgoing_stream_id(&mut self) -> StreamId {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        StreamId::new(id)
    }

    fn on_ingress(&mut self, buf: &mut BytesMut, events: &mut Vec<CodecEvent>) -> usize {
        let mut consumed = 0;
        loop {
            if buf.len() < FRAME_HDR {
                break;
            }
            let tag = buf[0];
            let stream = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
            let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
            if buf.len() < FRAME_HDR + len {
                break;
            }
            let full = buf.split_to(FRAME_HDR + len);
            consumed += FRAME_HDR + len;
            let payload = &full[FRAME_HDR..];
            let sid = StreamId::new(stream);
            match tag {
                TAG_HEADERS => {
                    let priority = payload[0];
                    let eom = payload[1] & 0x1 != 0;
                    let msg = decode_head(&payload[2..], stream);
                    events.push(CodecEvent::MessageBegin {
                        stream_id: sid,
                        priority,
                    });
                    events.push(CodecEvent::HeadersComplete {
                        stream_id: sid,
                        msg,
                    });
                    if eom {
                        events.push(CodecEvent::MessageComplete {
                            stream_id: sid,
                            upgrade: false,
                        });
                    }
                }
                TAG_BODY => {
                    let eom = payload[0] & 0x1 != 0;
                    events.push(CodecEvent::Body {
                        stream_id: sid,
                        chunk: Bytes::copy_from_slice(&payload[1..]),
                    });
                    if eom {
                        events.push(CodecEvent::MessageComplete {
                            stream_id: sid,
                            upgrade: false,
                        });
                    }
                }
                TAG_EOM => events.push(CodecEvent::MessageComplete {
                    stream_id: sid,
                    upgrade: false,
                }),
                TAG_RST => {
                    let code =
                        ErrorCode::from_u32(u32::from_be_bytes(payload[0..4].try_into().unwrap()));
                    events.push(CodecEvent::Abort {
                        stream_id: sid,
                        code,
                    });
                }
                TAG_GOAWAY => {
                    let last = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    let code =
                        ErrorCode::from_u32(u32::from_be_bytes(payload[4..8].try_into().unwrap()));
                    events.push(CodecEvent::Goaway {
                        last_good_stream_id: StreamId::new(last),
                        code,
                    });
                }
                TAG_PING_REQ => {
                    let id = u64::from_be_bytes(payload[0..8].try_into().unwrap());
                    events.push(CodecEvent::PingRequest { id });
                }
                TAG_PING_REP => {
                    let id = u64::from_be_bytes(payload[0..8].try_into().unwrap());
                    events.push(CodecEvent::PingReply { id });
                }
                TAG_WINDOW_UPDATE => {
                    let delta = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    events.push(CodecEvent::WindowUpdate {
                        stream_id: sid,
                        delta,
                    });
                }
                TAG_SETTINGS => {
                    let mut settings = Vec::new();
                    for entry in payload.chunks_exact(6) {
                        let id = u16::from_be_bytes([entry[0], entry[1]]);
                        let value = u32::from_be_bytes(entry[2..6].try_into().unwrap());
                        if let Some(id) = SettingId::from_u16(id) {
                            settings.push(Setting { id, value });
                        }
                    }
                    events.push(CodecEvent::Settings { settings });
                }
                TAG_PUSH_PROMISE => {
                    let promised = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    let msg = decode_head(&payload[4..], promised);
                    events.push(CodecEvent::PushMessageBegin {
                        stream_id: StreamId::new(promised),
                        assoc_stream_id: sid,
                    });
                    events.push(CodecEvent::HeadersComplete {
                        stream_id: StreamId::new(promised),
                        msg,
                    });
                }
                TAG_CHUNK_HEADER => {
                    let length = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
                    events.push(CodecEvent::ChunkHeader {
                        stream_id: sid,
                        length,
                    });
                }
                TAG_CHUNK_TERM => events.push(CodecEvent::ChunkComplete { stream_id: sid }),
                TAG_TRAILERS => events.push(CodecEvent::TrailersComplete {
                    stream_id: sid,
                    trailers: Vec::new(),
                }),
                TAG_BAD_NEW_STREAM => {
                    events.push(CodecEvent::Error {
                        stream_id: Some(sid),
                        error: CodecError::new(ErrorCode::ProtocolError, "malformed request head")
                            .with_status(400),
                        new_txn: true,
                    });
                }
                TAG_BAD_SESSION => {
                    events.push(CodecEvent::Error {
                        stream_id: None,
                        error: CodecError::new(ErrorCode::ProtocolError, "framing desync"),
                        new_txn: false,
                    });
                }
                TAG_BEGIN => {
                    events.push(CodecEvent::MessageBegin {
                        stream_id: sid,
                        priority: 0,
                    });
                }
                _ => {
                    events.push(CodecEvent::Error {
                        stream_id: None,
                        error: CodecError::new(ErrorCode::ProtocolError, "unknown frame tag"),
                        new_txn: false,
                    });
                }
            }
        }
        consumed
    }

    fn generate_headers(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        msg: &Message,
        eom: bool,
    ) -> Result<usize, CodecError> {
        let bytes = headers_frame(stream_id.value(), 0, eom, msg);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_body(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        chunk: &[u8],
        eom: bool,
    ) -> Result<usize, CodecError> {
        let bytes = body_frame(stream_id.value(), eom, chunk);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_chunk_header(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        length: usize,
    ) -> Result<usize, CodecError> {
        let bytes = frame(
            TAG_CHUNK_HEADER,
            stream_id.value(),
            &(length as u32).to_be_bytes(),
        );
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_chunk_terminator(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
    ) -> Result<usize, CodecError> {
        let bytes = frame(TAG_CHUNK_TERM, stream_id.value(), &[]);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_trailers(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        _trailers: &[http_session::HeaderField],
    ) -> Result<usize, CodecError> {
        let bytes = frame(TAG_TRAILERS, stream_id.value(), &[]);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_eom(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
    ) -> Result<usize, CodecError> {
        let bytes = eom_frame(stream_id.value());
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_rst_stream(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        code: ErrorCode,
    ) -> Result<usize, CodecError> {
        let bytes = rst_frame(stream_id.value(), code);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_goaway(
        &mut self,
        buf: &mut BytesMut,
        last_good_stream_id: StreamId,
        code: ErrorCode,
    ) -> Result<usize, CodecError> {
        let bytes = goaway_frame(last_good_stream_id.value(), code);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_ping_request(
        &mut self,
        buf: &mut BytesMut,
        id: u64,
    ) -> Result<usize, CodecError> {
        let bytes = ping_req_frame(id);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_ping_reply(&mut self, buf: &mut BytesMut, id: u64) -> Result<usize, CodecError> {
        let bytes = ping_rep_frame(id);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_window_update(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        delta: u32,
    ) -> Result<usize, CodecError> {
        let bytes = window_update_frame(stream_id.value(), delta);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_settings(
        &mut self,
        buf: &mut BytesMut,
        settings: &[Setting],
    ) -> Result<usize, CodecError> {
        let pairs: Vec<(SettingId, u32)> = settings.iter().map(|s| (s.id, s.value)).collect();
        let bytes = settings_frame(&pairs);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }

    fn generate_push_promise(
        &mut self,
        buf: &mut BytesMut,
        assoc_stream_id: StreamId,
        pushed_stream_id: StreamId,
        msg: &Message,
    ) -> Result<usize, CodecError> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&pushed_stream_id.value().to_be_bytes());
        encode_head(msg, &mut payload);
        let bytes = frame(TAG_PUSH_PROMISE, assoc_stream_id.value(), &payload);
        buf.put_slice(&bytes);
        Ok(bytes.len())
    }
}

// === Mock transport ===

#[derive(Debug, Default)]
pub struct TransportLog {
    pub writes: Vec<(Bytes, WriteFlags)>,
    pub completed: usize,
    pub pause_count: usize,
    pub resume_count: usize,
    pub reads_shutdown: bool,
    pub writes_shutdown: bool,
    pub closed: bool,
    pub reset: bool,
    pub fail_next_write: bool,
}

impl TransportLog {
    /// Everything submitted so far, concatenated.
    pub fn all_written(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (data, _) in &self.writes {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn frames(&self) -> Vec<WireFrame> {
        parse_frames(&self.all_written())
    }

    /// Frames matching a tag, in write order.
    pub fn frames_with_tag(&self, tag: u8) -> Vec<WireFrame> {
        self.frames().into_iter().filter(|f| f.tag == tag).collect()
    }
}

pub struct MockTransport {
    pub log: Rc<RefCell<TransportLog>>,
}

impl MockTransport {
    pub fn new() -> (Self, Rc<RefCell<TransportLog>>) {
        let log = Rc::new(RefCell::new(TransportLog::default()));
        (Self { log: log.clone() }, log)
    }
}

impl Transport for MockTransport {
    fn submit_write(&mut self, data: Bytes, flags: WriteFlags) -> io::Result<()> {
        let mut log = self.log.borrow_mut();
        if log.fail_next_write {
            log.fail_next_write = false;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
        }
        if log.writes_shutdown {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "writes shut"));
        }
        log.writes.push((data, flags));
        Ok(())
    }

    fn pending_write_bytes(&self) -> usize {
        let log = self.log.borrow();
        log.writes[log.completed..]
            .iter()
            .map(|(data, _)| data.len())
            .sum()
    }

    fn pause_reads(&mut self) {
        self.log.borrow_mut().pause_count += 1;
    }

    fn resume_reads(&mut self) {
        self.log.borrow_mut().resume_count += 1;
    }

    fn shutdown_reads(&mut self) {
        self.log.borrow_mut().reads_shutdown = true;
    }

    fn shutdown_writes(&mut self) {
        self.log.borrow_mut().writes_shutdown = true;
    }

    fn close_with_reset(&mut self) {
        let mut log = self.log.borrow_mut();
        log.reads_shutdown = true;
        log.writes_shutdown = true;
        log.closed = true;
        log.reset = true;
    }

    fn close(&mut self) {
        let mut log = self.log.borrow_mut();
        log.reads_shutdown = true;
        log.writes_shutdown = true;
        log.closed = true;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        "127.0.0.1:8080".parse().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        "127.0.0.1:54321".parse().ok()
    }
}

// === Recording handler ===

#[derive(Debug, Clone, PartialEq)]
pub enum Ev {
    Attached,
    Headers { status: Option<u16>, path: Option<String> },
    Body(usize),
    ChunkHeader(usize),
    ChunkComplete,
    Trailers,
    Eom,
    Upgrade,
    Error(String),
    Abort(ErrorCode),
    EgressPaused,
    EgressResumed,
    WriteError(String),
}

pub type EventLog = Rc<RefCell<Vec<Ev>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// When a scripted handler emits its response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RespondOn {
    Headers,
    Eom,
    Never,
}

/// Server-side handler with scripted behavior.
pub struct ScriptedHandler {
    pub log: EventLog,
    pub respond_on: RespondOn,
    pub status: u16,
    pub body: Option<Bytes>,
    pub pause_on_headers: bool,
    pub consume_body: bool,
    pub detach_after_respond: bool,
}

impl ScriptedHandler {
    pub fn responder(log: EventLog, status: u16, body: Option<Bytes>) -> Box<Self> {
        Box::new(Self {
            log,
            respond_on: RespondOn::Eom,
            status,
            body,
            pause_on_headers: false,
            consume_body: true,
            detach_after_respond: true,
        })
    }

    pub fn silent(log: EventLog) -> Box<Self> {
        Box::new(Self {
            log,
            respond_on: RespondOn::Never,
            status: 200,
            body: None,
            pause_on_headers: false,
            consume_body: true,
            detach_after_respond: false,
        })
    }

    fn respond(&mut self, txn: &mut TxnCtx<'_>) {
        let msg = Message::response(self.status);
        let _ = txn.send_headers(&msg);
        match self.body.take() {
            Some(body) => {
                let _ = txn.send_body(body, true);
            }
            None => {
                let _ = txn.send_eom();
            }
        }
        if self.detach_after_respond {
            txn.detach();
        }
    }
}

impl TransactionHandler for ScriptedHandler {
    fn on_attached(&mut self, _txn: &mut TxnCtx<'_>) {
        self.log.borrow_mut().push(Ev::Attached);
    }

    fn on_headers_complete(&mut self, txn: &mut TxnCtx<'_>, msg: Message) {
        self.log.borrow_mut().push(Ev::Headers {
            status: msg.status,
            path: msg.path.clone(),
        });
        if self.pause_on_headers {
            txn.pause_ingress();
        }
        if self.respond_on == RespondOn::Headers {
            self.respond(txn);
        }
    }

    fn on_body(&mut self, txn: &mut TxnCtx<'_>, chunk: Bytes) {
        self.log.borrow_mut().push(Ev::Body(chunk.len()));
        if self.consume_body {
            txn.notify_ingress_body_processed(chunk.len());
        }
    }

    fn on_chunk_header(&mut self, _txn: &mut TxnCtx<'_>, length: usize) {
        self.log.borrow_mut().push(Ev::ChunkHeader(length));
    }

    fn on_chunk_complete(&mut self, _txn: &mut TxnCtx<'_>) {
        self.log.borrow_mut().push(Ev::ChunkComplete);
    }

    fn on_trailers(&mut self, _txn: &mut TxnCtx<'_>, _trailers: Vec<http_session::HeaderField>) {
        self.log.borrow_mut().push(Ev::Trailers);
    }

    fn on_eom(&mut self, txn: &mut TxnCtx<'_>) {
        self.log.borrow_mut().push(Ev::Eom);
        if self.respond_on == RespondOn::Eom {
            self.respond(txn);
        }
    }

    fn on_upgrade(&mut self, _txn: &mut TxnCtx<'_>) {
        self.log.borrow_mut().push(Ev::Upgrade);
    }

    fn on_error(&mut self, txn: &mut TxnCtx<'_>, error: Error) {
        self.log.borrow_mut().push(Ev::Error(error.to_string()));
        txn.detach();
    }

    fn on_abort(&mut self, txn: &mut TxnCtx<'_>, code: ErrorCode) {
        self.log.borrow_mut().push(Ev::Abort(code));
        txn.detach();
    }

    fn on_egress_paused(&mut self, _txn: &mut TxnCtx<'_>) {
        self.log.borrow_mut().push(Ev::EgressPaused);
    }

    fn on_egress_resumed(&mut self, _txn: &mut TxnCtx<'_>) {
        self.log.borrow_mut().push(Ev::EgressResumed);
    }

    fn on_write_error(&mut self, txn: &mut TxnCtx<'_>, error: &Error) {
        self.log.borrow_mut().push(Ev::WriteError(error.to_string()));
        txn.detach();
    }
}

/// Client-side handler: sends a request on attach, records the response.
pub struct ClientHandler {
    pub log: EventLog,
    pub body: Option<Bytes>,
}

impl ClientHandler {
    pub fn get(log: EventLog) -> Box<Self> {
        Box::new(Self { log, body: None })
    }
}

impl TransactionHandler for ClientHandler {
    fn on_attached(&mut self, txn: &mut TxnCtx<'_>) {
        self.log.borrow_mut().push(Ev::Attached);
        let msg = Message::request("GET", "/");
        let _ = txn.send_headers(&msg);
        match self.body.take() {
            Some(body) => {
                let _ = txn.send_body(body, true);
            }
            None => {
                let _ = txn.send_eom();
            }
        }
    }

    fn on_headers_complete(&mut self, _txn: &mut TxnCtx<'_>, msg: Message) {
        self.log.borrow_mut().push(Ev::Headers {
            status: msg.status,
            path: msg.path.clone(),
        });
    }

    fn on_body(&mut self, txn: &mut TxnCtx<'_>, chunk: Bytes) {
        self.log.borrow_mut().push(Ev::Body(chunk.len()));
        txn.notify_ingress_body_processed(chunk.len());
    }

    fn on_eom(&mut self, txn: &mut TxnCtx<'_>) {
        self.log.borrow_mut().push(Ev::Eom);
        txn.detach();
    }

    fn on_error(&mut self, txn: &mut TxnCtx<'_>, error: Error) {
        self.log.borrow_mut().push(Ev::Error(error.to_string()));
        txn.detach();
    }

    fn on_abort(&mut self, txn: &mut TxnCtx<'_>, code: ErrorCode) {
        self.log.borrow_mut().push(Ev::Abort(code));
        txn.detach();
    }

    fn on_write_error(&mut self, txn: &mut TxnCtx<'_>, error: &Error) {
        self.log.borrow_mut().push(Ev::WriteError(error.to_string()));
        txn.detach();
    }
}

// === Controller and info callback ===

/// Hands out pre-queued handlers for inbound requests.
pub struct QueueController {
    pub handlers: Rc<RefCell<VecDeque<Box<dyn TransactionHandler>>>>,
}

impl QueueController {
    pub fn new() -> (Self, Rc<RefCell<VecDeque<Box<dyn TransactionHandler>>>>) {
        let handlers = Rc::new(RefCell::new(VecDeque::new()));
        (
            Self {
                handlers: handlers.clone(),
            },
            handlers,
        )
    }

    pub fn with(handlers: Vec<Box<dyn TransactionHandler>>) -> Self {
        Self {
            handlers: Rc::new(RefCell::new(handlers.into())),
        }
    }
}

impl SessionController for QueueController {
    fn get_request_handler(&mut self, _msg: &Message) -> Option<Box<dyn TransactionHandler>> {
        self.handlers.borrow_mut().pop_front()
    }
}

/// Controller with no handlers; every request falls back to a direct
/// error response.
pub struct NullController;

impl SessionController for NullController {
    fn get_request_handler(&mut self, _msg: &Message) -> Option<Box<dyn TransactionHandler>> {
        None
    }
}

#[derive(Debug, Default)]
pub struct InfoLog {
    pub created: usize,
    pub destroyed: usize,
    pub bytes_read: usize,
    pub bytes_written: usize,
    pub request_begin: usize,
    pub request_end: usize,
    pub activated: usize,
    pub deactivated: usize,
    pub ingress_messages: usize,
    pub ingress_errors: usize,
    pub ingress_paused: usize,
    pub limit_exceeded: usize,
    pub detached: usize,
    pub ping_replies: Vec<u64>,
    pub streams_full: usize,
    pub streams_not_full: usize,
}

pub struct RecordingInfo {
    pub log: Rc<RefCell<InfoLog>>,
}

impl RecordingInfo {
    pub fn new() -> (Box<Self>, Rc<RefCell<InfoLog>>) {
        let log = Rc::new(RefCell::new(InfoLog::default()));
        (Box::new(Self { log: log.clone() }), log)
    }
}

impl InfoCallback for RecordingInfo {
    fn on_create(&mut self) {
        self.log.borrow_mut().created += 1;
    }
    fn on_destroy(&mut self) {
        self.log.borrow_mut().destroyed += 1;
    }
    fn on_read(&mut self, bytes: usize) {
        self.log.borrow_mut().bytes_read += bytes;
    }
    fn on_write(&mut self, bytes: usize) {
        self.log.borrow_mut().bytes_written += bytes;
    }
    fn on_request_begin(&mut self) {
        self.log.borrow_mut().request_begin += 1;
    }
    fn on_request_end(&mut self, _max_ingress_queue: usize) {
        self.log.borrow_mut().request_end += 1;
    }
    fn on_activate_connection(&mut self) {
        self.log.borrow_mut().activated += 1;
    }
    fn on_deactivate_connection(&mut self) {
        self.log.borrow_mut().deactivated += 1;
    }
    fn on_ingress_message(&mut self, _msg: &Message) {
        self.log.borrow_mut().ingress_messages += 1;
    }
    fn on_ingress_error(&mut self, _error: &Error) {
        self.log.borrow_mut().ingress_errors += 1;
    }
    fn on_ingress_paused(&mut self) {
        self.log.borrow_mut().ingress_paused += 1;
    }
    fn on_ingress_limit_exceeded(&mut self) {
        self.log.borrow_mut().limit_exceeded += 1;
    }
    fn on_transaction_detached(&mut self) {
        self.log.borrow_mut().detached += 1;
    }
    fn on_ping_reply(&mut self, latency_ns: u64) {
        self.log.borrow_mut().ping_replies.push(latency_ns);
    }
    fn on_settings_outgoing_streams_full(&mut self) {
        self.log.borrow_mut().streams_full += 1;
    }
    fn on_settings_outgoing_streams_not_full(&mut self) {
        self.log.borrow_mut().streams_not_full += 1;
    }
}

// === Session drivers ===

pub fn downstream_session(
    codec: MockCodec,
    controller: Box<dyn SessionController>,
    config: SessionConfig,
) -> (Session, Rc<RefCell<TransportLog>>) {
    let (transport, log) = MockTransport::new();
    let session = Session::new(
        TransportDirection::Downstream,
        Box::new(transport),
        Box::new(codec),
        controller,
        config,
    );
    (session, log)
}

pub fn upstream_session(
    codec: MockCodec,
    config: SessionConfig,
) -> (Session, Rc<RefCell<TransportLog>>) {
    let (transport, log) = MockTransport::new();
    let session = Session::new(
        TransportDirection::Upstream,
        Box::new(transport),
        Box::new(codec),
        Box::new(NullController),
        config,
    );
    (session, log)
}

/// Run one event-loop turn: the end-of-loop write callback, if scheduled.
pub fn loop_turn(session: &mut Session) {
    if session.wants_write_callback() {
        session.run_loop_callback();
    }
}

/// Complete the oldest outstanding transport write.
pub fn complete_write(session: &mut Session, log: &Rc<RefCell<TransportLog>>) -> bool {
    let outstanding = {
        let log = log.borrow();
        log.writes.len() > log.completed
    };
    if outstanding {
        log.borrow_mut().completed += 1;
        session.on_write_success();
        true
    } else {
        false
    }
}

/// Run loop turns and write completions until the session goes quiet.
pub fn pump(session: &mut Session, log: &Rc<RefCell<TransportLog>>) {
    for _ in 0..1000 {
        let mut progress = false;
        if session.wants_write_callback() {
            session.run_loop_callback();
            progress = true;
        }
        if complete_write(session, log) {
            progress = true;
        }
        if !progress {
            return;
        }
    }
    panic!("session did not quiesce");
}
