//! Transport layer abstraction.
//!
//! The session owns one full-duplex byte stream through this trait. All
//! I/O is submission-based: `submit_write` queues bytes and the driver
//! reports the outcome later by calling `Session::on_write_success` /
//! `on_write_error`. Inbound bytes, EOF, and read errors likewise enter
//! the session through its `on_read_*` methods. Nothing here blocks.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;

/// Flags attached to one submitted write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// More data will follow shortly; the transport may delay flushing.
    pub cork: bool,
    /// This write ends a record (the final byte of a message).
    pub eor: bool,
}

impl WriteFlags {
    pub fn new(cork: bool, eor: bool) -> Self {
        Self { cork, eor }
    }
}

/// A full-duplex byte stream the session writes to and half-closes.
///
/// Completion routing is the driver's job: exactly one
/// `on_write_success` or `on_write_error` call per `submit_write`, in
/// submission order.
pub trait Transport {
    /// Queue one write. Completion is reported asynchronously.
    fn submit_write(&mut self, data: Bytes, flags: WriteFlags) -> io::Result<()>;

    /// Bytes accepted by `submit_write` but not yet written to the peer.
    fn pending_write_bytes(&self) -> usize;

    /// Stop delivering read data to the session.
    fn pause_reads(&mut self);

    /// Resume delivering read data to the session.
    fn resume_reads(&mut self);

    /// Half-close the read side.
    fn shutdown_reads(&mut self);

    /// Half-close the write side, flushing queued writes first.
    fn shutdown_writes(&mut self);

    /// Close both directions immediately, discarding queued writes and
    /// resetting the peer.
    fn close_with_reset(&mut self);

    /// Close both directions after queued writes drain.
    fn close(&mut self);

    /// Address of this end of the connection.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Address of the remote end of the connection.
    fn peer_addr(&self) -> Option<SocketAddr>;
}
