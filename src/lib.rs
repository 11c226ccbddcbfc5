//! http-session - protocol-agnostic HTTP session layer for
//! completion-based I/O drivers.
//!
//! This crate provides the orchestrator that multiplexes concurrent
//! request/response transactions over a single full-duplex byte stream.
//! It does not use async/await or tokio; all I/O is submitted through a
//! [`Transport`] trait and resumed via completion callbacks on one event
//! loop thread.
//!
//! # Features
//!
//! - Pluggable wire format via the [`SessionCodec`] trait
//! - Transaction lifecycle management with admission caps
//! - Priority-queued egress scheduling with round-robin fairness
//! - Flow control (connection and stream level)
//! - Read and write backpressure
//! - Graceful drain and abrupt reset shutdown
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `codec`: the codec abstraction and the event/message types it emits
//! - `session`: the session state machine, transactions, scheduling
//! - `transport`: the byte-stream abstraction the session drives
//!
//! Data flows transport bytes → read buffer → codec → session →
//! transaction handlers, and handler send calls → codec → write buffer →
//! one transport write per event-loop turn.

pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use codec::{
    CodecError, CodecEvent, DEFAULT_INITIAL_WINDOW_SIZE, ErrorCode, HeaderField, Message,
    SessionCodec, Setting, SettingId, StreamId, TransportDirection,
};
pub use config::SessionConfig;
pub use error::{ConnectionCloseReason, Error};
pub use session::{
    ByteEvent, ByteEventKind, DirectResponseHandler, InfoCallback, Session, SessionController,
    Transaction, TransactionHandler, TxnCtx, TxnOrigin,
};
pub use transport::{Transport, WriteFlags};
