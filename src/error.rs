//! Session error taxonomy.

use std::fmt;
use std::io;

use crate::codec::{CodecError, ErrorCode};

/// Errors surfaced to transaction handlers and callers of the session API.
#[derive(Debug)]
pub enum Error {
    /// Ingress parse error, scoped to a stream or to the session.
    Parse(CodecError),
    /// A send-* call could not be encoded by the codec.
    Codec(CodecError),
    /// Transport I/O failure.
    Transport(io::Error),
    /// EOF arrived while a message was still in flight.
    IngressEof,
    /// A write submitted to the transport failed.
    WriteFailed(io::Error),
    /// Send attempted beyond the available flow control window.
    FlowControlViolation,
    /// No ingress arrived within the read timeout.
    ReadTimeout,
    /// A submitted write did not complete within the write timeout.
    WriteTimeout,
    /// A transaction made no progress within its timeout.
    TransactionTimeout,
    /// The peer reset the stream.
    StreamAborted(ErrorCode),
    /// The stream was refused at admission (concurrency cap).
    StreamRefused,
    /// New transactions are not allowed (draining, shut down, or over the
    /// outgoing-stream cap).
    SessionClosed,
    /// The session is being torn down and the transaction was cut short.
    Dropped,
}

impl Error {
    /// HTTP status a direct error response should carry for this error.
    pub fn direct_response_status(&self) -> u16 {
        match self {
            Error::Parse(e) | Error::Codec(e) => e.status.unwrap_or(400),
            Error::ReadTimeout | Error::TransactionTimeout => 408,
            Error::StreamRefused | Error::SessionClosed => 503,
            _ => 500,
        }
    }

    /// Produce an equivalent error for delivery to another handler.
    /// `io::Error` is not `Clone`, so transport errors are rebuilt from
    /// their kind and message.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Parse(e) => Error::Parse(e.clone()),
            Error::Codec(e) => Error::Codec(e.clone()),
            Error::Transport(e) => Error::Transport(io::Error::new(e.kind(), e.to_string())),
            Error::IngressEof => Error::IngressEof,
            Error::WriteFailed(e) => Error::WriteFailed(io::Error::new(e.kind(), e.to_string())),
            Error::FlowControlViolation => Error::FlowControlViolation,
            Error::ReadTimeout => Error::ReadTimeout,
            Error::WriteTimeout => Error::WriteTimeout,
            Error::TransactionTimeout => Error::TransactionTimeout,
            Error::StreamAborted(code) => Error::StreamAborted(*code),
            Error::StreamRefused => Error::StreamRefused,
            Error::SessionClosed => Error::SessionClosed,
            Error::Dropped => Error::Dropped,
        }
    }

    /// Whether the error is scoped to a single stream rather than the
    /// whole session.
    pub fn is_stream_scoped(&self) -> bool {
        matches!(
            self,
            Error::StreamAborted(_)
                | Error::StreamRefused
                | Error::TransactionTimeout
                | Error::FlowControlViolation
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(e) => write!(f, "parse error: {e}"),
            Error::Codec(e) => write!(f, "codec error: {e}"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::IngressEof => write!(f, "EOF mid-message"),
            Error::WriteFailed(e) => write!(f, "write failed: {e}"),
            Error::FlowControlViolation => write!(f, "flow control violation"),
            Error::ReadTimeout => write!(f, "read timeout"),
            Error::WriteTimeout => write!(f, "write timeout"),
            Error::TransactionTimeout => write!(f, "transaction timeout"),
            Error::StreamAborted(code) => write!(f, "stream aborted: {code}"),
            Error::StreamRefused => write!(f, "stream refused"),
            Error::SessionClosed => write!(f, "session closed to new transactions"),
            Error::Dropped => write!(f, "connection dropped"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) | Error::WriteFailed(e) => Some(e),
            Error::Parse(e) | Error::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

/// The first cause that began closing a session, recorded once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCloseReason {
    /// Close reason not determined yet.
    None,
    /// Graceful drain completed.
    ShutdownRequested,
    /// Peer sent GOAWAY.
    GoawayReceived,
    /// Peer closed the read side.
    ReadEof,
    /// Read side failed.
    IoReadError,
    /// Write side failed.
    IoWriteError,
    /// Session-level parse error.
    SessionParseError,
    /// Read timeout fired.
    TimedOut,
    /// Local caller dropped the connection.
    Dropped,
}
